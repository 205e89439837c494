//! Registry of loaded device descriptions
//!
//! Documents are loaded once at start-up and shared read-only. Channel-count
//! specialisations are created on demand and cached, so resolving the same
//! hint twice hands back the same `Arc`.

use crate::device::DeviceDescription;
use crate::error::{ModelError, Result};
use crate::frame::PacketFields;
use crate::xml;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Default)]
pub struct DescriptionRegistry {
    documents: Vec<Arc<DeviceDescription>>,
    /// (document position, channel count) -> specialised clone
    specialised: RwLock<AHashMap<(usize, u32), Arc<DeviceDescription>>>,
}

impl DescriptionRegistry {
    pub fn new(documents: Vec<DeviceDescription>) -> Self {
        Self {
            documents: documents.into_iter().map(Arc::new).collect(),
            specialised: RwLock::new(AHashMap::new()),
        }
    }

    /// Load every `*.xml` file of a directory, in file name order.
    ///
    /// Files that fail to parse are skipped. Fails only if nothing loads.
    pub fn load_all(dir: &Path) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "xml"))
            .collect();
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            match xml::from_file(&path) {
                Ok(device) => documents.push(device),
                Err(e) => error!("Could not load device description {}: {}", path.display(), e),
            }
        }
        if documents.is_empty() {
            return Err(ModelError::NoDescriptions(dir.display().to_string()));
        }
        info!(
            "Loaded {} device descriptions from {}",
            documents.len(),
            dir.display()
        );
        Ok(Self::new(documents))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> impl Iterator<Item = &Arc<DeviceDescription>> + '_ {
        self.documents.iter()
    }

    /// Find the description for a type code and firmware version.
    ///
    /// `count_hint` is the channel count observed on the wire; a document
    /// with a wire-derived channel count is specialised to it.
    pub fn resolve(
        &self,
        type_code: u16,
        firmware: i32,
        count_hint: Option<u32>,
    ) -> Option<Arc<DeviceDescription>> {
        let mut partial: Option<(usize, u32)> = None;
        for (position, document) in self.documents.iter().enumerate() {
            if !document
                .supported_types
                .iter()
                .any(|t| t.matches_code(type_code, firmware))
            {
                continue;
            }
            if let (true, Some(count)) = (document.has_count_from_sysinfo(), count_hint) {
                if document.bound_count != Some(count) {
                    if partial.is_none() && document.bound_count.is_none() {
                        partial = Some((position, count));
                    }
                    continue;
                }
            }
            return Some(Arc::clone(document));
        }
        let (position, count) = partial?;
        Some(self.specialise(position, count))
    }

    /// Find a description by its type id string
    pub fn resolve_by_id(&self, type_id: &str) -> Option<Arc<DeviceDescription>> {
        self.documents
            .iter()
            .find(|d| d.supported_types.iter().any(|t| t.matches_id(type_id)))
            .cloned()
    }

    /// Find a description from the fields of a pairing packet
    pub fn resolve_by_packet<P: PacketFields + ?Sized>(
        &self,
        packet: &P,
    ) -> Option<Arc<DeviceDescription>> {
        let position = self.documents.iter().position(|d| {
            d.supported_types.iter().any(|t| t.matches_packet(packet))
        })?;
        let document = &self.documents[position];
        match document.count_from_payload(packet.payload()) {
            Some(count) if document.bound_count != Some(count) => {
                Some(self.specialise(position, count))
            },
            _ => Some(Arc::clone(document)),
        }
    }

    fn specialise(&self, position: usize, count: u32) -> Arc<DeviceDescription> {
        if let Some(existing) = self.specialised.read().get(&(position, count)) {
            return Arc::clone(existing);
        }
        let mut cache = self.specialised.write();
        let entry = cache.entry((position, count)).or_insert_with(|| {
            debug!(
                "Specialising {} to {} channels",
                self.documents[position].file, count
            );
            Arc::new(self.documents[position].with_channel_count(count))
        });
        Arc::clone(entry)
    }
}
