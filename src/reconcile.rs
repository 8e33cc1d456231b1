//! Matches what the metadata sheet declares against what the lab actually
//! uploaded.

use std::collections::{BTreeSet, HashSet};

use crate::log_summary::FolderContext;
use crate::workbook::SampleDeclaration;

/// A declared sample whose files were all found on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSample {
    pub sample_id: String,
    pub primary: String,
    pub secondary: Option<String>,
    pub paired: bool,
}

impl ResolvedSample {
    pub fn files(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.secondary.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub resolved: Vec<ResolvedSample>,
    /// Sample ids dropped because a required file could not be matched.
    pub rejected: Vec<String>,
    /// Remote files no sample claims.
    pub undeclared: Vec<String>,
    /// Declared names that were only satisfied through the substring pass.
    pub recovered: Vec<(String, String)>,
}

enum Lookup {
    Exact(String),
    Recovered(String),
    Ambiguous(Vec<String>),
    Missing,
}

pub struct Reconciler;

impl Reconciler {
    /// `remote_files` are basenames already filtered to allowed extensions.
    pub fn reconcile(
        ctx: &mut FolderContext<'_>,
        declared: &[SampleDeclaration],
        remote_files: &[String],
    ) -> Reconciliation {
        let available: BTreeSet<&str> = remote_files.iter().map(String::as_str).collect();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut result = Reconciliation::default();

        for sample in declared {
            let Some(primary_name) = sample.primary.as_deref() else {
                ctx.sample_error(&sample.sample_id, "no sequencing file declared");
                result.rejected.push(sample.sample_id.clone());
                continue;
            };

            let mut notes = Vec::new();
            let primary = match Self::lookup(primary_name, &available, &claimed) {
                Lookup::Exact(name) => name,
                Lookup::Recovered(name) => {
                    notes.push((primary_name.to_string(), name.clone()));
                    name
                }
                missing => {
                    ctx.sample_error(&sample.sample_id, describe_missing(primary_name, missing));
                    result.rejected.push(sample.sample_id.clone());
                    continue;
                }
            };
            claimed.insert(primary.clone());

            let secondary = match sample.secondary.as_deref() {
                Some(secondary_name) => match Self::lookup(secondary_name, &available, &claimed) {
                    Lookup::Exact(name) => Some(name),
                    Lookup::Recovered(name) => {
                        notes.push((secondary_name.to_string(), name.clone()));
                        Some(name)
                    }
                    missing if sample.paired => {
                        ctx.sample_error(
                            &sample.sample_id,
                            describe_missing(secondary_name, missing),
                        );
                        claimed.remove(&primary);
                        result.rejected.push(sample.sample_id.clone());
                        continue;
                    }
                    _ => {
                        ctx.sample_warn(
                            &sample.sample_id,
                            format!("secondary file {secondary_name} not found; kept as single-end"),
                        );
                        None
                    }
                },
                None if sample.paired => {
                    ctx.sample_error(
                        &sample.sample_id,
                        "paired layout but no secondary file declared",
                    );
                    claimed.remove(&primary);
                    result.rejected.push(sample.sample_id.clone());
                    continue;
                }
                None => None,
            };
            if let Some(name) = &secondary {
                claimed.insert(name.clone());
            }

            for (declared_name, found) in notes {
                ctx.sample_warn(
                    &sample.sample_id,
                    format!("declared {declared_name} resolved to {found}"),
                );
                result.recovered.push((declared_name, found));
            }
            result.resolved.push(ResolvedSample {
                sample_id: sample.sample_id.clone(),
                primary,
                secondary,
                paired: sample.paired,
            });
        }

        for file in remote_files {
            if !claimed.contains(file) {
                ctx.warn(format!("file {file} is not declared in the metadata"));
                result.undeclared.push(file.clone());
            }
        }
        result
    }

    fn lookup(declared: &str, available: &BTreeSet<&str>, claimed: &HashSet<String>) -> Lookup {
        let declared = declared.trim();
        let declared = declared.rsplit('/').next().unwrap_or(declared);
        if available.contains(declared) && !claimed.contains(declared) {
            return Lookup::Exact(declared.to_string());
        }

        let candidates: Vec<&str> = available
            .iter()
            .copied()
            .filter(|name| *name != declared && name.contains(declared) && !claimed.contains(*name))
            .collect();
        match candidates.as_slice() {
            [] => Lookup::Missing,
            [only] => Lookup::Recovered(only.to_string()),
            many => {
                let prefixed: Vec<&str> = many
                    .iter()
                    .copied()
                    .filter(|name| name.starts_with(declared))
                    .collect();
                match prefixed.as_slice() {
                    [only] => Lookup::Recovered(only.to_string()),
                    _ => Lookup::Ambiguous(many.iter().map(|name| name.to_string()).collect()),
                }
            }
        }
    }
}

fn describe_missing(declared: &str, lookup: Lookup) -> String {
    match lookup {
        Lookup::Ambiguous(candidates) => {
            format!("declared file {declared} matches several uploads: {candidates:?}")
        }
        _ => format!("declared file {declared} not found in upload"),
    }
}
