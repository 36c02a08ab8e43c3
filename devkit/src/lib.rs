/*!
# Farm DevKit - Outils de test pour la passerelle

Bibliothèque utilisée par les tests d'intégration de `farm-gateway` :
- constructeurs de trames série (flux tels qu'émis par les microcontrôleurs)
- doubles du cloud (puits de télémétrie, flux de commandes)
- serveur de lien qui capture les enveloppes, topologies locales, attentes bornées
*/

pub mod cloud_stub;
pub mod frame_helpers;
pub mod test_utils;

pub use cloud_stub::{RecordingSink, StaticFeed};
pub use frame_helpers::{wire_stream, FrameBuilder};
pub use test_utils::{fast_timing, free_port, init_test_logging, wait_until, CapturingServer, TopologyBuilder};
