//! Task Group Catalog
//!
//! Named task groups, each an ordered set of priority tiers ("echelons") of
//! interchangeable candidate models.
//!
//! # Architecture
//!
//! ```text
//! TaskGroupCatalog
//!   └─ RwLock<Arc<CatalogSnapshot>>   <-- swapped whole on register/reload
//!        ├─ fast_group
//!        │    ├─ echelon1 (priority 1): modelA, modelB
//!        │    └─ echelon2 (priority 2): modelC
//!        └─ batch_group
//!             └─ default  (priority 1): modelD
//! ```
//!
//! Readers clone the current `Arc<CatalogSnapshot>` and work on it without
//! holding any lock, so a reload never exposes half-updated state and a
//! dispatch sees one consistent topology from start to finish.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::config::GroupConfig;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while building or resolving against the catalog
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// No group with this name is registered
    #[error("task group not found: {0}")]
    GroupNotFound(String),

    /// The group exists but has no echelon or task alias with this name
    #[error("no echelon or task '{sub}' in task group '{group}'")]
    EchelonNotFound { group: String, sub: String },

    /// The group exists but resolves to no candidates
    #[error("task group '{0}' has no candidates")]
    NoCandidates(String),

    /// The reference string could not be parsed
    #[error("invalid group reference '{reference}': {reason}")]
    InvalidReference {
        reference: String,
        reason: &'static str,
    },

    /// The group definition violates a structural invariant
    #[error("invalid task group '{group}': {reason}")]
    InvalidGroup { group: String, reason: String },

    /// A group with this name is already registered
    #[error("task group already registered: {0}")]
    DuplicateGroup(String),
}

// ============================================================================
// Echelon / TaskGroup
// ============================================================================

/// One priority tier of a task group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Echelon {
    /// Echelon name, unique within its group
    pub name: String,
    /// Priority (lower is tried first)
    pub priority: u32,
    /// Candidate model ids in preference order
    pub models: Vec<String>,
}

impl Echelon {
    /// Create a new echelon
    pub fn new(name: impl Into<String>, priority: u32, models: Vec<String>) -> Self {
        Self {
            name: name.into(),
            priority,
            models,
        }
    }

    /// Whether a model is a candidate of this echelon
    #[must_use]
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m == model_id)
    }
}

/// A validated task group
///
/// Echelons are stored sorted by ascending priority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskGroup {
    name: String,
    echelons: Vec<Echelon>,
    tasks: HashMap<String, String>,
}

impl TaskGroup {
    /// Build a group, validating its echelons
    ///
    /// # Errors
    ///
    /// Returns `InvalidGroup` if the name is empty, an echelon has no
    /// candidates, or two echelons share a priority or a name.
    pub fn new(name: impl Into<String>, mut echelons: Vec<Echelon>) -> Result<Self, CatalogError> {
        let name = name.into();
        let invalid = |reason: String| CatalogError::InvalidGroup {
            group: name.clone(),
            reason,
        };

        if name.is_empty() || name.contains('.') {
            return Err(invalid("group name must be non-empty and contain no '.'".to_string()));
        }

        let mut names = HashSet::new();
        let mut priorities = HashSet::new();
        for echelon in &echelons {
            if echelon.models.is_empty() {
                return Err(invalid(format!("echelon '{}' has no candidates", echelon.name)));
            }
            if !names.insert(echelon.name.as_str()) {
                return Err(invalid(format!("duplicate echelon name '{}'", echelon.name)));
            }
            if !priorities.insert(echelon.priority) {
                return Err(invalid(format!("duplicate priority {}", echelon.priority)));
            }
        }

        echelons.sort_by_key(|e| e.priority);

        Ok(Self {
            name,
            echelons,
            tasks: HashMap::new(),
        })
    }

    /// Add a task alias pointing at one of the group's echelons
    ///
    /// # Errors
    ///
    /// Returns `InvalidGroup` if the echelon does not exist or the alias
    /// shadows an echelon name.
    pub fn with_task(
        mut self,
        task: impl Into<String>,
        echelon: impl Into<String>,
    ) -> Result<Self, CatalogError> {
        let task = task.into();
        let echelon = echelon.into();

        if self.echelon(&echelon).is_none() {
            return Err(CatalogError::InvalidGroup {
                group: self.name.clone(),
                reason: format!("task '{task}' points at unknown echelon '{echelon}'"),
            });
        }
        if self.echelon(&task).is_some() {
            return Err(CatalogError::InvalidGroup {
                group: self.name.clone(),
                reason: format!("task '{task}' shadows an echelon name"),
            });
        }

        self.tasks.insert(task, echelon);
        Ok(self)
    }

    /// Build a group from configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidGroup` on any structural violation.
    pub fn from_config(config: &GroupConfig) -> Result<Self, CatalogError> {
        let echelons = config
            .echelons
            .iter()
            .map(|e| Echelon::new(e.name.clone(), e.priority, e.models.clone()))
            .collect();

        let mut group = Self::new(config.name.clone(), echelons)?;

        // Sorted for deterministic error reporting
        let mut tasks: Vec<_> = config.tasks.iter().collect();
        tasks.sort();
        for (task, echelon) in tasks {
            group = group.with_task(task.clone(), echelon.clone())?;
        }
        Ok(group)
    }

    /// Group name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Echelons in ascending priority order
    #[must_use]
    pub fn echelons(&self) -> &[Echelon] {
        &self.echelons
    }

    /// The first echelon tried (lowest priority number)
    #[must_use]
    pub fn primary_echelon(&self) -> Option<&Echelon> {
        self.echelons.first()
    }

    /// Look up an echelon by name
    #[must_use]
    pub fn echelon(&self, name: &str) -> Option<&Echelon> {
        self.echelons.iter().find(|e| e.name == name)
    }

    /// Look up an echelon by name or task alias
    #[must_use]
    pub fn echelon_for(&self, sub: &str) -> Option<&Echelon> {
        self.echelon(sub)
            .or_else(|| self.tasks.get(sub).and_then(|e| self.echelon(e)))
    }

    /// The echelon holding a model, if any
    #[must_use]
    pub fn echelon_of(&self, model_id: &str) -> Option<&Echelon> {
        self.echelons.iter().find(|e| e.contains(model_id))
    }

    /// Echelons with a strictly higher priority number than `priority`
    pub fn echelons_after(&self, priority: u32) -> impl Iterator<Item = &Echelon> {
        self.echelons.iter().filter(move |e| e.priority > priority)
    }

    /// Registered task aliases
    #[must_use]
    pub fn tasks(&self) -> &HashMap<String, String> {
        &self.tasks
    }

    /// Whether the group has no candidates at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.echelons.is_empty()
    }
}

// ============================================================================
// Group Reference
// ============================================================================

/// A parsed `group`, `group.echelon` or `group.task` reference
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupReference {
    /// Group name
    pub group: String,
    /// Echelon name or task alias
    pub sub: Option<String>,
}

impl GroupReference {
    /// Reference to a whole group
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            group: name.into(),
            sub: None,
        }
    }

    /// Reference to an echelon or task within a group
    pub fn with_sub(group: impl Into<String>, sub: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            sub: Some(sub.into()),
        }
    }

    /// Parse a reference, splitting on the first `.`
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` for an empty group or sub name.
    pub fn parse(reference: &str) -> Result<Self, CatalogError> {
        let invalid = |reason| CatalogError::InvalidReference {
            reference: reference.to_string(),
            reason,
        };

        let trimmed = reference.trim();
        let (group, sub) = match trimmed.split_once('.') {
            Some((group, sub)) => (group, Some(sub)),
            None => (trimmed, None),
        };

        if group.is_empty() {
            return Err(invalid("empty group name"));
        }
        if sub.is_some_and(str::is_empty) {
            return Err(invalid("empty echelon or task name"));
        }

        Ok(Self {
            group: group.to_string(),
            sub: sub.map(str::to_string),
        })
    }
}

impl FromStr for GroupReference {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for GroupReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub {
            Some(sub) => write!(f, "{}.{sub}", self.group),
            None => f.write_str(&self.group),
        }
    }
}

/// Result of resolving a reference
#[derive(Clone, Debug)]
pub struct ResolvedGroup {
    /// The resolved group
    pub group: Arc<TaskGroup>,
    /// The selected echelon (none for an empty group)
    pub echelon: Option<Echelon>,
    /// Candidates of the selected echelon, in order
    pub candidates: Vec<String>,
}

// ============================================================================
// Snapshot
// ============================================================================

/// An immutable view of every registered group
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    groups: Vec<Arc<TaskGroup>>,
    index: HashMap<String, usize>,
    version: u64,
}

impl CatalogSnapshot {
    fn build(groups: Vec<TaskGroup>, version: u64) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(groups.len());
        for (i, group) in groups.iter().enumerate() {
            if index.insert(group.name().to_string(), i).is_some() {
                return Err(CatalogError::DuplicateGroup(group.name().to_string()));
            }
        }
        Ok(Self {
            groups: groups.into_iter().map(Arc::new).collect(),
            index,
            version,
        })
    }

    /// Look up a group
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<TaskGroup>> {
        self.index.get(name).map(|&i| &self.groups[i])
    }

    /// Groups in registration order
    pub fn groups(&self) -> impl Iterator<Item = &Arc<TaskGroup>> {
        self.groups.iter()
    }

    /// Snapshot version (increments on every swap)
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of groups
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no group is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Resolve a group by name
    ///
    /// # Errors
    ///
    /// Returns `GroupNotFound` if the group is not registered.
    pub fn resolve_group(&self, name: &str) -> Result<Arc<TaskGroup>, CatalogError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| CatalogError::GroupNotFound(name.to_string()))
    }

    /// Resolve a reference to its candidates
    ///
    /// # Errors
    ///
    /// Returns `GroupNotFound` or `EchelonNotFound`. A group without
    /// echelons resolves successfully with no candidates.
    pub fn resolve(&self, reference: &GroupReference) -> Result<ResolvedGroup, CatalogError> {
        let group = self.resolve_group(&reference.group)?;

        let echelon = match &reference.sub {
            None => group.primary_echelon().cloned(),
            Some(sub) => Some(group.echelon_for(sub).cloned().ok_or_else(|| {
                CatalogError::EchelonNotFound {
                    group: reference.group.clone(),
                    sub: sub.clone(),
                }
            })?),
        };

        let candidates = echelon.as_ref().map(|e| e.models.clone()).unwrap_or_default();

        Ok(ResolvedGroup {
            group,
            echelon,
            candidates,
        })
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Thread-safe, read-mostly registry of task groups
pub struct TaskGroupCatalog {
    snapshot: RwLock<Arc<CatalogSnapshot>>,
}

impl Default for TaskGroupCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroupCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
        }
    }

    /// Create a catalog holding `groups`
    ///
    /// # Errors
    ///
    /// Returns `DuplicateGroup` if two groups share a name.
    pub fn with_groups(groups: Vec<TaskGroup>) -> Result<Self, CatalogError> {
        Ok(Self {
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::build(groups, 0)?)),
        })
    }

    /// Create a catalog from configuration
    ///
    /// # Errors
    ///
    /// Returns the first invalid or duplicate group.
    pub fn from_config(groups: &[GroupConfig]) -> Result<Self, CatalogError> {
        Self::with_groups(groups_from_config(groups)?)
    }

    /// Current immutable snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Current snapshot version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.snapshot.read().version
    }

    /// Register one more group
    ///
    /// # Errors
    ///
    /// Returns `DuplicateGroup` if the name is taken.
    pub fn register(&self, group: TaskGroup) -> Result<(), CatalogError> {
        let mut guard = self.snapshot.write();
        if guard.get(group.name()).is_some() {
            return Err(CatalogError::DuplicateGroup(group.name().to_string()));
        }

        let mut groups: Vec<TaskGroup> = guard.groups().map(|g| (**g).clone()).collect();
        groups.push(group);
        *guard = Arc::new(CatalogSnapshot::build(groups, guard.version + 1)?);
        Ok(())
    }

    /// Replace every group at once
    ///
    /// On error the previous snapshot stays in place.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateGroup` if two groups share a name.
    pub fn reload(&self, groups: Vec<TaskGroup>) -> Result<u64, CatalogError> {
        let mut guard = self.snapshot.write();
        let version = guard.version + 1;
        let next = CatalogSnapshot::build(groups, version)?;
        let count = next.len();
        *guard = Arc::new(next);
        drop(guard);

        tracing::info!(version, groups = count, "Task group catalog reloaded");
        Ok(version)
    }

    /// Resolve a group by name
    ///
    /// # Errors
    ///
    /// Returns `GroupNotFound` if the group is not registered.
    pub fn resolve_group(&self, name: &str) -> Result<Arc<TaskGroup>, CatalogError> {
        self.snapshot().resolve_group(name)
    }

    /// Resolve a reference to its candidates
    ///
    /// # Errors
    ///
    /// Returns `GroupNotFound` or `EchelonNotFound`.
    pub fn resolve(&self, reference: &GroupReference) -> Result<ResolvedGroup, CatalogError> {
        self.snapshot().resolve(reference)
    }

    /// Parse and resolve a reference string
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference`, `GroupNotFound` or `EchelonNotFound`.
    pub fn resolve_str(&self, reference: &str) -> Result<ResolvedGroup, CatalogError> {
        self.resolve(&GroupReference::parse(reference)?)
    }

    /// Echelons of a group in strictly increasing priority order
    ///
    /// # Errors
    ///
    /// Returns `GroupNotFound` if the group is not registered.
    pub fn echelons_by_priority(&self, name: &str) -> Result<Vec<Echelon>, CatalogError> {
        Ok(self.resolve_group(name)?.echelons().to_vec())
    }

    /// Group names in registration order
    #[must_use]
    pub fn list_groups(&self) -> Vec<String> {
        self.snapshot()
            .groups()
            .map(|g| g.name().to_string())
            .collect()
    }

    /// Whether a group is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.snapshot.read().get(name).is_some()
    }
}

/// Validate a list of group configurations
///
/// # Errors
///
/// Returns the first invalid group.
pub fn groups_from_config(groups: &[GroupConfig]) -> Result<Vec<TaskGroup>, CatalogError> {
    groups.iter().map(TaskGroup::from_config).collect()
}
