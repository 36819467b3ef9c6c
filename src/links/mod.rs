use chrono::{NaiveDateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::tree::model::TaskEntity;

/// What kind of entity a link endpoint refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeType {
    ProcessInstance,
    Task,
}

/// Hierarchy classifier of a link record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HierarchyType {
    /// Points at the top-most ancestor of the whole call hierarchy
    Root,
    /// Points at the immediate parent scope
    Parent,
    /// Points at a direct child scope
    Child,
}

/// Link kind; currently only containment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    Child,
}

/// A directed, non-owning hierarchy record connecting two scopes. These
/// exist purely for navigation/querying: weak back-references keyed by
/// scope id and type, never ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityLink {
    pub id: String,
    pub scope_id: String,
    pub scope_type: ScopeType,
    pub hierarchy_type: HierarchyType,
    pub reference_scope_id: String,
    pub reference_scope_type: ScopeType,
    pub link_type: LinkType,
    pub created_at: NaiveDateTime,
}

/// Persisted table of entity links, a public read surface for callers
/// navigating call hierarchies.
#[derive(Debug, Default)]
pub struct LinkTable {
    links: DashMap<String, EntityLink>,
    by_scope: DashMap<String, DashSet<String>>,
    by_reference: DashMap<String, DashSet<String>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        scope_id: &str,
        scope_type: ScopeType,
        hierarchy_type: HierarchyType,
        reference_scope_id: &str,
        reference_scope_type: ScopeType,
    ) -> EntityLink {
        let link = EntityLink {
            id: cuid2::create_id(),
            scope_id: scope_id.to_string(),
            scope_type,
            hierarchy_type,
            reference_scope_id: reference_scope_id.to_string(),
            reference_scope_type,
            link_type: LinkType::Child,
            created_at: Utc::now().naive_utc(),
        };
        self.links.insert(link.id.clone(), link.clone());
        self.by_scope
            .entry(link.scope_id.clone())
            .or_default()
            .insert(link.id.clone());
        self.by_reference
            .entry(link.reference_scope_id.clone())
            .or_default()
            .insert(link.id.clone());
        link
    }

    pub fn links_for_scope(&self, scope_id: &str) -> Vec<EntityLink> {
        match self.by_scope.get(scope_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.links.get(id.key()).map(|l| l.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn parent_link(&self, scope_id: &str) -> Option<EntityLink> {
        self.links_for_scope(scope_id)
            .into_iter()
            .find(|l| l.hierarchy_type == HierarchyType::Parent)
    }

    pub fn root_link(&self, scope_id: &str) -> Option<EntityLink> {
        self.links_for_scope(scope_id)
            .into_iter()
            .find(|l| l.hierarchy_type == HierarchyType::Root)
    }

    /// All ROOT-classified links pointing at the given top-level scope:
    /// the "everything in this call hierarchy" query.
    pub fn links_rooted_at(&self, root_scope_id: &str) -> Vec<EntityLink> {
        match self.by_reference.get(root_scope_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.links.get(id.key()).map(|l| l.clone()))
                .filter(|l| l.hierarchy_type == HierarchyType::Root)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Remove every link whose scope is one of the given ids. Cascading
    /// deletes are scoped to the removed subtree, never the whole
    /// hierarchy.
    pub fn remove_scopes(&self, scope_ids: &[String]) {
        for scope_id in scope_ids {
            let Some((_, ids)) = self.by_scope.remove(scope_id) else {
                continue;
            };
            for link_id in ids.iter() {
                if let Some((_, link)) = self.links.remove(link_id.key()) {
                    if let Some(set) = self.by_reference.get(&link.reference_scope_id) {
                        set.remove(&link.id);
                    }
                }
            }
        }
    }

    /// Copy all link records of the given scopes (for command rollback)
    pub fn snapshot_scopes(&self, scope_ids: &[String]) -> Vec<EntityLink> {
        scope_ids
            .iter()
            .flat_map(|id| self.links_for_scope(id))
            .collect()
    }

    /// Drop current records for the given scopes and reinstate a snapshot
    pub fn restore_scopes(&self, current_scope_ids: &[String], snapshot: Vec<EntityLink>) {
        self.remove_scopes(current_scope_ids);
        for link in snapshot {
            self.by_scope
                .entry(link.scope_id.clone())
                .or_default()
                .insert(link.id.clone());
            self.by_reference
                .entry(link.reference_scope_id.clone())
                .or_default()
                .insert(link.id.clone());
            self.links.insert(link.id.clone(), link);
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Keeps the link table consistent with instance and task lifecycle.
/// Invoked by the migration executor after each create/terminate.
pub struct HierarchyLinkSynchronizer {
    table: Arc<LinkTable>,
}

impl HierarchyLinkSynchronizer {
    pub fn new(table: Arc<LinkTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<LinkTable> {
        &self.table
    }

    /// The ROOT target for anything nested under the given instance: the
    /// instance's own ROOT link target, or the instance itself when it
    /// has none (it is the top of the hierarchy).
    fn root_target_of(&self, instance_id: &str) -> String {
        self.table
            .root_link(instance_id)
            .map(|l| l.reference_scope_id)
            .unwrap_or_else(|| instance_id.to_string())
    }

    /// Record PARENT and ROOT links for a child instance spawned under a
    /// parent instance.
    pub fn instance_started(&self, child_instance_id: &str, parent_instance_id: &str) {
        let root_target = self.root_target_of(parent_instance_id);
        self.table.add(
            child_instance_id,
            ScopeType::ProcessInstance,
            HierarchyType::Parent,
            parent_instance_id,
            ScopeType::ProcessInstance,
        );
        self.table.add(
            child_instance_id,
            ScopeType::ProcessInstance,
            HierarchyType::Root,
            &root_target,
            ScopeType::ProcessInstance,
        );
        debug!(
            child_instance_id,
            parent_instance_id, root_target, "Linked child instance into hierarchy"
        );
    }

    /// Record PARENT and ROOT links for a freshly created task
    pub fn task_created(&self, task: &TaskEntity) {
        let root_target = self.root_target_of(&task.instance_id);
        self.table.add(
            &task.id,
            ScopeType::Task,
            HierarchyType::Parent,
            &task.instance_id,
            ScopeType::ProcessInstance,
        );
        self.table.add(
            &task.id,
            ScopeType::Task,
            HierarchyType::Root,
            &root_target,
            ScopeType::ProcessInstance,
        );
    }

    /// Drop link records for a task whose token moved away
    pub fn task_removed(&self, task_id: &str) {
        self.table.remove_scopes(&[task_id.to_string()]);
    }

    /// Cascade-remove link records for terminated instances and every
    /// task that lived inside them.
    pub fn instances_terminated(&self, instance_ids: &[String], task_ids: &[String]) {
        self.table.remove_scopes(instance_ids);
        self.table.remove_scopes(task_ids);
        debug!(
            instances = instance_ids.len(),
            tasks = task_ids.len(),
            "Removed hierarchy links for terminated scopes"
        );
    }
}
