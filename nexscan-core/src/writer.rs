//! Writer registry: who owns which unique-key source.
//!
//! Every device taking part in a scan is a writer. A writer with external
//! files runs its own acquisition path and writes its own keys into those
//! files; the scan's keys collection links to them. A writer with only a key
//! path owns an in-process key dataset the collection links to directly. A
//! writer may opt out of the global keys when another writer in the same
//! acquisition chain already records its timing.

use crate::{Error, Result};
use log::warn;
use std::collections::BTreeSet;

/// Name of the global unique-keys dataset inside the keys collection.
pub const UNIQUE_KEYS: &str = "uniqueKeys";

/// Writer properties supplied at configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterDescriptor {
    pub name: String,
    pub external_file_names: BTreeSet<String>,
    pub unique_keys_path: Option<String>,
    pub suppress_global_keys: bool,
}

impl WriterDescriptor {
    /// Creates an in-process writer with no key dataset.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            external_file_names: BTreeSet::new(),
            unique_keys_path: None,
            suppress_global_keys: false,
        }
    }

    /// How this writer takes part in key bookkeeping.
    pub fn kind(&self) -> WriterKind {
        if self.suppress_global_keys {
            return WriterKind::Suppressed;
        }
        match &self.unique_keys_path {
            None => WriterKind::Untracked,
            Some(path) if self.external_file_names.is_empty() => WriterKind::InProcess {
                key_path: path.trim_start_matches('/').to_string(),
            },
            Some(path) => WriterKind::External {
                files: self.external_file_names.iter().cloned().collect(),
                key_path: path.clone(),
            },
        }
    }
}

/// Key bookkeeping role of a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterKind {
    /// Owns a key dataset at `key_path`, relative to its own group.
    InProcess { key_path: String },
    /// Writes keys at `key_path` inside each of `files`.
    External { files: Vec<String>, key_path: String },
    /// Opted out of key bookkeeping.
    Suppressed,
    /// Declares no key dataset of its own.
    Untracked,
}

/// Target of a link in the keys collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTarget {
    /// Dataset in the writer's in-process tree, relative to its group.
    Internal { path: String },
    /// Dataset inside a file written by another process.
    External { file: String, path: String },
}

/// One entry of the keys collection contributed by a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLink {
    /// Name of the entry inside the keys collection.
    pub name: String,
    /// Writer contributing the entry.
    pub writer: String,
    pub target: KeyTarget,
}

/// Catalogue of every writer taking part in a scan.
#[derive(Debug, Clone, Default)]
pub struct WriterRegistry {
    writers: Vec<WriterDescriptor>,
    links: Vec<KeyLink>,
}

impl WriterRegistry {
    /// Builds the registry, resolving each writer's keys-collection entry.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateWriterName`] if two writers share a name and
    /// [`Error::DuplicateWriterKey`] if two entries of the keys collection
    /// would share a name or a target.
    pub fn build(writers: Vec<WriterDescriptor>) -> Result<Self> {
        for (i, writer) in writers.iter().enumerate() {
            if writers[..i].iter().any(|w| w.name == writer.name) {
                return Err(Error::DuplicateWriterName(writer.name.clone()));
            }
        }

        let mut links: Vec<KeyLink> = Vec::new();
        for writer in &writers {
            let candidates = match writer.kind() {
                WriterKind::InProcess { key_path } => vec![KeyLink {
                    name: writer.name.clone(),
                    writer: writer.name.clone(),
                    target: KeyTarget::Internal { path: key_path },
                }],
                WriterKind::External { files, key_path } => files
                    .into_iter()
                    .map(|file| KeyLink {
                        name: file_link_name(&file),
                        writer: writer.name.clone(),
                        target: KeyTarget::External {
                            file,
                            path: key_path.clone(),
                        },
                    })
                    .collect(),
                WriterKind::Untracked => {
                    if !writer.external_file_names.is_empty() {
                        warn!(
                            "Writer '{}' owns external files but declares no unique keys path",
                            writer.name
                        );
                    }
                    Vec::new()
                }
                WriterKind::Suppressed => Vec::new(),
            };

            for link in candidates {
                if link.name == UNIQUE_KEYS {
                    return Err(Error::DuplicateWriterKey {
                        first: UNIQUE_KEYS.to_string(),
                        second: link.writer,
                        location: link.name,
                    });
                }
                if let Some(existing) = links
                    .iter()
                    .find(|l| l.name == link.name || l.target == link.target)
                {
                    return Err(Error::DuplicateWriterKey {
                        first: existing.writer.clone(),
                        second: link.writer,
                        location: link.name,
                    });
                }
                links.push(link);
            }
        }

        Ok(Self { writers, links })
    }

    /// All writers in registration order.
    pub fn writers(&self) -> &[WriterDescriptor] {
        &self.writers
    }

    /// Looks a writer up by name.
    pub fn get(&self, name: &str) -> Option<&WriterDescriptor> {
        self.writers.iter().find(|w| w.name == name)
    }

    /// Entries of the keys collection, in registration order.
    pub fn key_links(&self) -> &[KeyLink] {
        &self.links
    }

    /// Whether the global unique-keys dataset is written. It is omitted only
    /// when there is at least one writer and every writer suppresses it.
    pub fn writes_global_keys(&self) -> bool {
        self.writers.is_empty() || !self.writers.iter().all(|w| w.suppress_global_keys)
    }
}

/// Keys-collection entry name for an external file: its final path segment.
fn file_link_name(file: &str) -> String {
    file.rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(file)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_process(name: &str, path: &str) -> WriterDescriptor {
        WriterDescriptor {
            unique_keys_path: Some(path.to_string()),
            ..WriterDescriptor::new(name)
        }
    }

    fn external(name: &str, file: &str, path: &str) -> WriterDescriptor {
        WriterDescriptor {
            external_file_names: BTreeSet::from([file.to_string()]),
            unique_keys_path: Some(path.to_string()),
            ..WriterDescriptor::new(name)
        }
    }

    #[test]
    fn test_kinds() {
        assert_eq!(WriterDescriptor::new("x").kind(), WriterKind::Untracked);
        assert_eq!(
            in_process("det1", "/keys").kind(),
            WriterKind::InProcess {
                key_path: "keys".to_string()
            }
        );
        assert!(matches!(
            external("det2", "detector2.h5", "/entry/NDAttributes/NDArrayUniqueId").kind(),
            WriterKind::External { .. }
        ));
        let suppressed = WriterDescriptor {
            suppress_global_keys: true,
            ..in_process("det3", "keys")
        };
        assert_eq!(suppressed.kind(), WriterKind::Suppressed);
    }

    #[test]
    fn test_links_for_internal_and_external() {
        let registry = WriterRegistry::build(vec![
            WriterDescriptor::new("x"),
            in_process("det1", "uniqueKeys"),
            external(
                "det2",
                "/dls/data/detector2.h5",
                "/entry/NDAttributes/NDArrayUniqueId",
            ),
        ])
        .unwrap();

        let links = registry.key_links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].name, "det1");
        assert_eq!(
            links[0].target,
            KeyTarget::Internal {
                path: "uniqueKeys".to_string()
            }
        );
        assert_eq!(links[1].name, "detector2.h5");
        assert_eq!(
            links[1].target,
            KeyTarget::External {
                file: "/dls/data/detector2.h5".to_string(),
                path: "/entry/NDAttributes/NDArrayUniqueId".to_string()
            }
        );
        assert!(registry.writes_global_keys());
    }

    #[test]
    fn test_duplicate_external_target_rejected() {
        let err = WriterRegistry::build(vec![
            external("det1", "shared.h5", "/entry/keys"),
            external("det2", "shared.h5", "/entry/keys"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateWriterKey { .. }));
    }

    #[test]
    fn test_duplicate_link_name_rejected() {
        let err = WriterRegistry::build(vec![
            external("det1", "/a/panda.h5", "/entry/keys"),
            external("det2", "/b/panda.h5", "/entry/other_keys"),
        ])
        .unwrap_err();
        match err {
            Error::DuplicateWriterKey {
                first,
                second,
                location,
            } => {
                assert_eq!(first, "det1");
                assert_eq!(second, "det2");
                assert_eq!(location, "panda.h5");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_link_named_like_global_keys_rejected() {
        let err = WriterRegistry::build(vec![in_process("uniqueKeys", "keys")]).unwrap_err();
        assert!(matches!(err, Error::DuplicateWriterKey { .. }));
    }

    #[test]
    fn test_duplicate_writer_name_rejected() {
        let err = WriterRegistry::build(vec![WriterDescriptor::new("x"), WriterDescriptor::new("x")])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateWriterName(_)));
    }

    #[test]
    fn test_suppressed_writers_contribute_nothing() {
        let suppressed = WriterDescriptor {
            suppress_global_keys: true,
            ..external("malcolm", "malcolm.h5", "/entry/keys")
        };
        let registry = WriterRegistry::build(vec![suppressed.clone()]).unwrap();
        assert!(registry.key_links().is_empty());
        assert!(!registry.writes_global_keys());

        let mixed = WriterRegistry::build(vec![suppressed, WriterDescriptor::new("x")]).unwrap();
        assert!(mixed.writes_global_keys());
    }

    #[test]
    fn test_empty_registry_writes_global_keys() {
        let registry = WriterRegistry::build(Vec::new()).unwrap();
        assert!(registry.writes_global_keys());
        assert!(registry.get("x").is_none());
    }
}
