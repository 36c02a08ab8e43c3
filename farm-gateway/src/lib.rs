/*!
# Farm Gateway - Passerelle maître/esclave des enceintes de culture

Chaque nœud possède ses ports série (microcontrôleurs des enceintes), un
serveur de lien TCP et un ou plusieurs clients de lien :
- le maître parle au cloud (commandes, télémétrie) et route les commandes
  vers l'esclave propriétaire du code système
- l'esclave applique les commandes reçues et remonte sa télémétrie au maître

Toutes les boucles longues s'arrêtent sur un `CancellationToken`.
*/

pub mod cloud;
pub mod config;
pub mod health;
pub mod http;
pub mod ingestor;
pub mod logging;
pub mod master;
pub mod node;
pub mod registry;
pub mod relay;
pub mod serial;
pub mod slave;
pub mod state;
pub mod status;
pub mod transport;
pub mod watchdog;

pub use config::{GatewayConfig, Topology};
pub use logging::LogContext;
pub use node::{Collaborators, GatewayNode, NodeError, NodeTiming};
