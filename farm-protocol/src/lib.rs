/*!
# Farm Protocol - Catalogue, codec série et enveloppe inter-nœuds

Couche pure (aucune I/O) partagée par le maître et les esclaves :
- identités matérielles (UID) et logiques (codes système)
- catalogue fermé des items échangés avec les microcontrôleurs
- codec binaire des trames série
- enveloppe JSON versionnée des liens TCP
*/

pub mod catalog;
pub mod codec;
pub mod envelope;
pub mod identity;

pub use catalog::{DataClass, Domain, ItemKind};
pub use codec::{check_command, decode, encode_command, split_wire_chunks, CodecError, EncodedCommand, Frame, Item};
pub use envelope::{CommandEnvelope, DataPoint, Envelope, EnvelopeError, TelemetryBatch};
pub use identity::{Shift, SystemCode, Uid, DEFAULT_BROADCAST_UID};
