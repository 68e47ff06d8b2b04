use crate::models::ServiceKind;
use crate::{Error, Result};
use std::collections::HashMap;

/// Maps a foreign-key constraint name to the service whose data must exist first.
///
/// When a fact write is rejected by a constraint, the commit path looks the constraint up
/// here to learn which prerequisite service to wait on before re-pulling the batch.
/// Immutable after construction; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct ForeignKeyServiceDependencyMap {
    dependencies: HashMap<String, ServiceKind>,
}

impl ForeignKeyServiceDependencyMap {
    #[tracing::instrument(level = "debug", skip(pairs))]
    pub fn new<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, ServiceKind)>,
        S: AsRef<str>,
    {
        let mut dependencies = HashMap::new();
        for (name, service) in pairs {
            let name = name.as_ref().trim();
            if name.is_empty() {
                return Err(Error::InvalidInput(
                    "foreign key constraint name is empty".to_string(),
                ));
            }
            let key = name.to_ascii_lowercase();
            match dependencies.insert(key, service) {
                Some(existing) if existing != service => {
                    return Err(Error::InvalidInput(format!(
                        "constraint '{name}' maps to both '{existing}' and '{service}'"
                    )));
                }
                _ => {}
            }
        }
        Ok(Self { dependencies })
    }

    /// Case-insensitive lookup. Pure; no side effects.
    pub fn try_get_dependency(&self, constraint_name: &str) -> Option<ServiceKind> {
        self.dependencies
            .get(&constraint_name.trim().to_ascii_lowercase())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

/// Parse `constraint=service,constraint=service`.
pub fn parse_dependency_pairs(raw: &str) -> Result<Vec<(String, ServiceKind)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, service) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidInput(format!(
                    "foreign key dependency '{pair}' must look like constraint=service"
                ))
            })?;
            let service = service
                .parse::<ServiceKind>()
                .map_err(|e| Error::InvalidInput(e.to_string()))?;
            Ok((name.trim().to_string(), service))
        })
        .collect()
}
