/*!
Constructeurs de trames série pour les tests

Produit les octets tels qu'un microcontrôleur les émet (fenêtres de 21
octets, terminateur inclus), à partir des noms du catalogue.
*/

use anyhow::{anyhow, Result};
use farm_protocol::catalog::{self, ItemKind};
use farm_protocol::codec::{to_wire, FrameWriter};
use farm_protocol::Uid;

/// Une trame en construction : un UID, des items nommés.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    uid: Uid,
    items: Vec<(ItemKind, u8, u32)>,
}

impl FrameBuilder {
    pub fn new(uid: Uid) -> Self {
        Self { uid, items: Vec::new() }
    }

    pub fn from_hex(uid: &str) -> Result<Self> {
        Ok(Self::new(uid.parse()?))
    }

    /// Mesure Main désignée par son nom de catalogue.
    pub fn main(mut self, name: &str, value: u32) -> Result<Self> {
        let entry = catalog::main_by_name(name).ok_or_else(|| anyhow!("no main item named '{name}'"))?;
        self.items.push((ItemKind::Main, entry.subtype, value));
        Ok(self)
    }

    /// Commande émise par un microcontrôleur (relayée entre zones).
    pub fn command(mut self, action: &str, value: u32) -> Result<Self> {
        let entry = catalog::command_by_name(action).ok_or_else(|| anyhow!("no command named '{action}'"))?;
        self.items.push((ItemKind::Command, entry.subtype, value));
        Ok(self)
    }

    /// Item brut, y compris hors catalogue.
    pub fn raw(mut self, kind: ItemKind, subtype: u8, value: u32) -> Self {
        self.items.push((kind, subtype, value));
        self
    }

    /// Trame de 20 octets, sans terminateur.
    pub fn frame(&self) -> Result<Vec<u8>> {
        let mut writer = FrameWriter::new(self.uid);
        for (kind, subtype, value) in &self.items {
            writer.push(kind.as_byte(), *subtype, *value)?;
        }
        Ok(writer.finish())
    }

    /// Fenêtre de 21 octets telle que lue sur le port.
    pub fn wire(&self) -> Result<Vec<u8>> {
        Ok(to_wire(&self.frame()?))
    }
}

/// Concatène plusieurs trames en un flux série continu.
pub fn wire_stream(frames: &[FrameBuilder]) -> Result<Vec<u8>> {
    let mut stream = Vec::new();
    for frame in frames {
        stream.extend(frame.wire()?);
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_protocol::{decode, split_wire_chunks, Item};

    #[test]
    fn builder_output_decodes() {
        let stream = wire_stream(&[
            FrameBuilder::from_hex("C0C0C0C1").unwrap().main("temperature", 21).unwrap(),
            FrameBuilder::from_hex("C0C0C0C1").unwrap().command("on_off", 1).unwrap(),
        ])
        .unwrap();
        assert_eq!(stream.len(), 42);

        let frames: Vec<_> = split_wire_chunks(&stream).map(|c| decode(c).unwrap()).collect();
        assert!(matches!(&frames[0].items[0], Item::Main(m) if m.name() == "temperature" && m.value == 21));
        assert!(matches!(&frames[1].items[0], Item::Command { name: "on_off", value: 1, .. }));
    }

    #[test]
    fn unknown_names_are_errors() {
        assert!(FrameBuilder::new(Uid::new(1)).main("nope", 1).is_err());
        assert!(FrameBuilder::new(Uid::new(1)).command("nope", 1).is_err());
    }
}
