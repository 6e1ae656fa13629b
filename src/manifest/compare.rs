// Manifest comparison

use std::collections::{BTreeSet, HashMap};

use crate::manifest::Manifest;

/// Filename-level diff between two manifests.
///
/// Common filenames are compared by their content hash. Sets are ordered
/// so downstream task emission is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestComparison {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub changed: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

impl ManifestComparison {
    pub fn create(manifest: &Manifest, old_manifest: Option<&Manifest>) -> Self {
        let mut comp = ManifestComparison::default();

        let Some(old_manifest) = old_manifest else {
            comp.added = manifest
                .file_manifest_list
                .elements
                .iter()
                .map(|fm| fm.filename.clone())
                .collect();
            return comp;
        };

        let mut old_files: HashMap<&str, &[u8; 20]> = old_manifest
            .file_manifest_list
            .elements
            .iter()
            .map(|fm| (fm.filename.as_str(), &fm.hash))
            .collect();

        for fm in &manifest.file_manifest_list.elements {
            match old_files.remove(fm.filename.as_str()) {
                Some(old_hash) if *old_hash == fm.hash => {
                    comp.unchanged.insert(fm.filename.clone());
                }
                Some(_) => {
                    comp.changed.insert(fm.filename.clone());
                }
                None => {
                    comp.added.insert(fm.filename.clone());
                }
            }
        }

        // any remaining old files were removed
        comp.removed = old_files.keys().map(|name| name.to_string()).collect();

        comp
    }
}
