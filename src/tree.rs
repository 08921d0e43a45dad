use futures::FutureExt;
use futures::future::{BoxFuture, Shared, try_join_all};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProjectRegistry;
use crate::error::FetchError;
use crate::filter::{self, InstanceFilter};
use crate::gcloud::ComputeInventory;
use crate::model::{
    ImageVariant, InstanceDetail, InstanceLocator, InstanceRecord, InstanceStatus, OsKind,
    ProjectSummary, ROOT_CAPTION, ZoneLocator,
};
use crate::selection::RefreshScope;
use crate::session::ConnectionTracker;

pub const TREE_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Project,
    Zone,
    Instance,
}

/// Identity of a node independent of any particular `Node` handle; survives
/// reloads that replace the handles themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Root,
    Project(String),
    Zone(ZoneLocator),
    Instance(InstanceLocator),
}

#[derive(Debug, Clone)]
pub enum NodePayload {
    Root,
    Project(ProjectSummary),
    Zone(ZoneLocator),
    Instance(InstanceDetail),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    ChildrenReset(NodeRef),
}

type SharedFetch = Shared<BoxFuture<'static, Result<Vec<Node>, FetchError>>>;

/// Raw children plus the at-most-one in-flight fetch for them. The mutex is
/// held only for slot bookkeeping, never across an await.
#[derive(Default)]
struct ChildSlot {
    raw: Option<Vec<Node>>,
    inflight: Option<SharedFetch>,
}

struct NodeInner {
    payload: NodePayload,
    children: Mutex<ChildSlot>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn root() -> Self {
        Self::from_payload(NodePayload::Root)
    }

    pub fn project(summary: ProjectSummary) -> Self {
        Self::from_payload(NodePayload::Project(summary))
    }

    pub fn zone(locator: ZoneLocator) -> Self {
        Self::from_payload(NodePayload::Zone(locator))
    }

    pub fn instance(
        zone: ZoneLocator,
        id: String,
        name: String,
        os: OsKind,
        status: InstanceStatus,
    ) -> Self {
        let locator = InstanceLocator::new(zone.project, zone.zone, name);
        Self::from_payload(NodePayload::Instance(InstanceDetail {
            locator,
            id,
            os,
            status,
        }))
    }

    fn from_payload(payload: NodePayload) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                payload,
                children: Mutex::new(ChildSlot::default()),
            }),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.payload() {
            NodePayload::Root => NodeKind::Root,
            NodePayload::Project(_) => NodeKind::Project,
            NodePayload::Zone(_) => NodeKind::Zone,
            NodePayload::Instance(_) => NodeKind::Instance,
        }
    }

    pub fn payload(&self) -> &NodePayload {
        &self.inner.payload
    }

    pub fn node_ref(&self) -> NodeRef {
        match self.payload() {
            NodePayload::Root => NodeRef::Root,
            NodePayload::Project(summary) => NodeRef::Project(summary.id.clone()),
            NodePayload::Zone(zone) => NodeRef::Zone(zone.clone()),
            NodePayload::Instance(detail) => NodeRef::Instance(detail.locator.clone()),
        }
    }

    pub fn display_text(&self) -> String {
        match self.payload() {
            NodePayload::Root => ROOT_CAPTION.to_string(),
            NodePayload::Project(summary) => summary.display_text(),
            NodePayload::Zone(zone) => zone.zone.clone(),
            NodePayload::Instance(detail) => detail.locator.name.clone(),
        }
    }

    pub fn image_variant(&self) -> ImageVariant {
        match self.payload() {
            NodePayload::Root => ImageVariant::Root,
            NodePayload::Project(summary) if summary.is_accessible() => ImageVariant::Project,
            NodePayload::Project(_) => ImageVariant::ProjectInaccessible,
            NodePayload::Zone(_) => ImageVariant::Zone,
            NodePayload::Instance(detail) => match detail.status {
                InstanceStatus::Running => ImageVariant::InstanceRunning,
                InstanceStatus::Stopped => ImageVariant::InstanceStopped,
                InstanceStatus::Other(_) => ImageVariant::InstanceOther,
            },
        }
    }

    /// Inaccessible projects stay selectable but never expand.
    pub fn can_expand(&self) -> bool {
        match self.payload() {
            NodePayload::Instance(_) => false,
            NodePayload::Project(summary) => summary.is_accessible(),
            _ => true,
        }
    }

    fn slot(&self) -> MutexGuard<'_, ChildSlot> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached_raw(&self) -> Option<Vec<Node>> {
        self.slot().raw.clone()
    }
}

enum FetchPlan {
    Cached(Vec<Node>),
    Fetch(SharedFetch),
}

/// Lazy hierarchical cache over the tracked-project inventory. Fetches run
/// on demand, are deduplicated per node, and replace raw children wholesale;
/// every replacement publishes exactly one `ChildrenReset` for that node.
pub struct ResourceTree {
    root: Node,
    registry: Arc<dyn ProjectRegistry>,
    inventory: Arc<dyn ComputeInventory>,
    tracker: ConnectionTracker,
    filter: Mutex<InstanceFilter>,
    events: broadcast::Sender<TreeEvent>,
}

impl ResourceTree {
    pub fn new(
        registry: Arc<dyn ProjectRegistry>,
        inventory: Arc<dyn ComputeInventory>,
        tracker: ConnectionTracker,
    ) -> Self {
        let (events, _receiver) = broadcast::channel(TREE_EVENT_CAPACITY);
        Self {
            root: Node::root(),
            registry,
            inventory,
            tracker,
            filter: Mutex::new(InstanceFilter::default()),
            events,
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// Filter changes are pure view changes: no fetch, no notification.
    pub fn set_filter(&self, filter: InstanceFilter) {
        *self.lock_filter() = filter;
    }

    pub fn is_connected(&self, locator: &InstanceLocator) -> bool {
        self.tracker.is_connected(locator)
    }

    /// Filtered children of `node`, fetching raw children first if they are
    /// missing or `force_reload` is set. Concurrent calls for one node share
    /// a single backend fetch; `cancel` belonging to the caller that started
    /// the fetch cancels it for every awaiter, while a joiner's token only
    /// abandons that joiner's wait. A caller whose shared fetch died of
    /// someone else's cancellation retries once with a fetch of its own.
    pub async fn children(
        &self,
        node: &Node,
        force_reload: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Node>, FetchError> {
        if node.kind() == NodeKind::Instance {
            return Ok(Vec::new());
        }
        match self.children_once(node, force_reload, cancel).await {
            Err(FetchError::Cancelled) if !cancel.is_cancelled() => {
                // The failed driver cleared the in-flight slot on its way out.
                self.children_once(node, force_reload, cancel).await
            }
            result => result,
        }
    }

    async fn children_once(
        &self,
        node: &Node,
        force_reload: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Node>, FetchError> {
        let plan = self.plan_fetch(node, force_reload, cancel);
        let raw = match plan {
            FetchPlan::Cached(raw) => raw,
            FetchPlan::Fetch(fetch) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    result = fetch => result?,
                }
            }
        };
        Ok(self.apply_filter(&raw))
    }

    /// Filtered view of already loaded raw children; never fetches. The
    /// render path uses only this.
    pub fn cached_children(&self, node: &Node) -> Option<Vec<Node>> {
        let raw = node.cached_raw()?;
        Some(self.apply_filter(&raw))
    }

    /// Drops `node`'s raw children without fetching or notifying. Descendant
    /// instance identities are deregistered from the connection tracker. An
    /// in-flight fetch for the node is left to land.
    pub fn invalidate(&self, node: &Node) {
        let dropped = node.slot().raw.take();
        if let Some(children) = dropped {
            for child in &children {
                forget_subtree(&self.tracker, child);
            }
        }
    }

    pub fn add_project(&self, id: &str) -> Result<bool, FetchError> {
        let added = self.registry.add(id)?;
        if added {
            self.invalidate(&self.root);
        }
        Ok(added)
    }

    pub fn remove_project(&self, id: &str) -> Result<(), FetchError> {
        if !self.registry.remove(id)? {
            return Err(FetchError::UnknownIdentity(format!(
                "project '{id}' is not tracked"
            )));
        }
        self.invalidate(&self.root);
        Ok(())
    }

    /// `reload_projects` true drops the whole tree so the next root fetch
    /// re-lists tracked projects. False keeps the project collection and only
    /// drops each loaded project's zone subtree, so project-level observers
    /// see nothing.
    pub fn refresh(&self, reload_projects: bool) {
        if reload_projects {
            self.invalidate(&self.root);
            return;
        }
        let Some(projects) = self.root.cached_raw() else {
            return;
        };
        for project in &projects {
            self.invalidate(project);
        }
    }

    /// Executes a selection-derived scope. A scope naming a node that is no
    /// longer loaded is a logged no-op.
    pub fn apply_refresh(&self, scope: &RefreshScope) {
        match scope {
            RefreshScope::AllProjects => self.refresh(true),
            RefreshScope::ZonesOf(project) => {
                match self.find_node(&NodeRef::Project(project.clone())) {
                    Some(node) => self.invalidate(&node),
                    None => debug!("refresh scope targets unloaded project {project}"),
                }
            }
            RefreshScope::InstancesOf(zone) => {
                match self.find_node(&NodeRef::Zone(zone.clone())) {
                    Some(node) => self.invalidate(&node),
                    None => debug!("refresh scope targets unloaded zone {zone}"),
                }
            }
        }
    }

    /// Walks loaded children only; an unloaded identity is simply not found.
    pub fn find_node(&self, target: &NodeRef) -> Option<Node> {
        if *target == NodeRef::Root {
            return Some(self.root.clone());
        }
        find_in(&self.root, target)
    }

    fn plan_fetch(&self, node: &Node, force_reload: bool, cancel: &CancellationToken) -> FetchPlan {
        let mut slot = node.slot();
        if let Some(inflight) = &slot.inflight {
            return FetchPlan::Fetch(inflight.clone());
        }
        if !force_reload && let Some(raw) = &slot.raw {
            return FetchPlan::Cached(raw.clone());
        }
        let fetch = self.start_fetch(node, cancel);
        slot.inflight = Some(fetch.clone());
        FetchPlan::Fetch(fetch)
    }

    /// Builds the single shared fetch for a node. The driver itself commits
    /// the result: on success it swaps raw children, reconciles the tracker
    /// (forget the replaced subtree, then register new instances so a
    /// surviving locator is not wiped by its older twin), and publishes one
    /// reset. On failure it only clears the in-flight slot, leaving the
    /// stale view intact.
    fn start_fetch(&self, node: &Node, cancel: &CancellationToken) -> SharedFetch {
        let loader = self.loader_for(node);
        let cancel = cancel.clone();
        let node = node.clone();
        let tracker = self.tracker.clone();
        let events = self.events.clone();
        async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
                result = loader => result,
            };
            match result {
                Ok(children) => {
                    let replaced = {
                        let mut slot = node.slot();
                        let replaced = slot.raw.replace(children.clone());
                        slot.inflight = None;
                        replaced
                    };
                    if let Some(previous) = replaced {
                        for child in &previous {
                            forget_subtree(&tracker, child);
                        }
                    }
                    for child in &children {
                        if let NodePayload::Instance(detail) = child.payload() {
                            tracker.register(&detail.locator);
                        }
                    }
                    let _ = events.send(TreeEvent::ChildrenReset(node.node_ref()));
                    Ok(children)
                }
                Err(error) => {
                    node.slot().inflight = None;
                    Err(error)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn loader_for(&self, node: &Node) -> BoxFuture<'static, Result<Vec<Node>, FetchError>> {
        match node.payload() {
            NodePayload::Root => {
                let registry = Arc::clone(&self.registry);
                let inventory = Arc::clone(&self.inventory);
                async move { load_projects(registry, inventory).await }.boxed()
            }
            NodePayload::Project(summary) => {
                let inventory = Arc::clone(&self.inventory);
                let summary = summary.clone();
                async move { load_zones(inventory, summary).await }.boxed()
            }
            NodePayload::Zone(zone) => {
                let inventory = Arc::clone(&self.inventory);
                let zone = zone.clone();
                async move { load_instances(inventory, zone).await }.boxed()
            }
            NodePayload::Instance(_) => async move { Ok(Vec::new()) }.boxed(),
        }
    }

    fn apply_filter(&self, raw: &[Node]) -> Vec<Node> {
        let filter = self.lock_filter().clone();
        filter::apply(raw, &filter)
    }

    fn lock_filter(&self) -> MutexGuard<'_, InstanceFilter> {
        self.filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn find_in(node: &Node, target: &NodeRef) -> Option<Node> {
    let children = node.cached_raw()?;
    for child in children {
        if &child.node_ref() == target {
            return Some(child);
        }
        if let Some(found) = find_in(&child, target) {
            return Some(found);
        }
    }
    None
}

fn forget_subtree(tracker: &ConnectionTracker, node: &Node) {
    if let NodePayload::Instance(detail) = node.payload() {
        tracker.forget(&detail.locator);
        return;
    }
    let dropped = node.slot().raw.take();
    let Some(children) = dropped else {
        return;
    };
    for child in &children {
        forget_subtree(tracker, child);
    }
}

/// Root loader: list tracked ids, resolve display metadata concurrently, and
/// turn a per-project access denial into an inaccessible placeholder. Any
/// other per-project failure fails the whole fetch.
async fn load_projects(
    registry: Arc<dyn ProjectRegistry>,
    inventory: Arc<dyn ComputeInventory>,
) -> Result<Vec<Node>, FetchError> {
    let tracked = registry.list()?;
    let lookups = tracked.into_iter().map(|id| {
        let inventory = Arc::clone(&inventory);
        async move {
            match inventory.project_metadata(&id).await {
                Ok(metadata) => Ok(ProjectSummary::accessible(id, metadata.display_name)),
                Err(FetchError::AccessDenied(_)) => Ok(ProjectSummary::inaccessible(id)),
                Err(error) => Err(error),
            }
        }
    });
    let mut summaries = try_join_all(lookups).await?;
    summaries.sort_by(|a, b| {
        a.display_text()
            .cmp(&b.display_text())
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(summaries.into_iter().map(Node::project).collect())
}

/// Zone loader: zones are synthesized from the project's instance listing,
/// so empty zones never appear and an inaccessible project yields no
/// children without a backend call.
async fn load_zones(
    inventory: Arc<dyn ComputeInventory>,
    project: ProjectSummary,
) -> Result<Vec<Node>, FetchError> {
    if !project.is_accessible() {
        return Ok(Vec::new());
    }
    let records = inventory.list_instances(&project.id).await?;
    let zones: BTreeSet<String> = records.into_iter().map(|record| record.zone).collect();
    Ok(zones
        .into_iter()
        .map(|zone| Node::zone(ZoneLocator::new(project.id.clone(), zone)))
        .collect())
}

async fn load_instances(
    inventory: Arc<dyn ComputeInventory>,
    zone: ZoneLocator,
) -> Result<Vec<Node>, FetchError> {
    let records = inventory.list_instances(&zone.project).await?;
    let mut records: Vec<InstanceRecord> = records
        .into_iter()
        .filter(|record| record.zone == zone.zone)
        .collect();
    records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    Ok(records
        .into_iter()
        .map(|record| Node::instance(zone.clone(), record.id, record.name, record.os, record.status))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{Node, NodeRef, ResourceTree, TreeEvent};
    use crate::config::ProjectRegistry;
    use crate::error::FetchError;
    use crate::filter::InstanceFilter;
    use crate::gcloud::ComputeInventory;
    use crate::model::{
        InstanceLocator, InstanceRecord, InstanceStatus, OsKind, ProjectMetadata, ZoneLocator,
    };
    use crate::selection::RefreshScope;
    use crate::session::{ConnectionTracker, SessionBroker, SessionEvent};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    struct NullBroker;

    impl SessionBroker for NullBroker {
        fn is_connected(&self, _locator: &InstanceLocator) -> bool {
            false
        }
    }

    struct MemoryRegistry {
        projects: Mutex<Vec<String>>,
    }

    impl MemoryRegistry {
        fn with(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                projects: Mutex::new(ids.iter().map(|id| id.to_string()).collect()),
            })
        }
    }

    impl ProjectRegistry for MemoryRegistry {
        fn list(&self) -> Result<Vec<String>, FetchError> {
            Ok(self.projects.lock().unwrap().clone())
        }

        fn add(&self, id: &str) -> Result<bool, FetchError> {
            let mut projects = self.projects.lock().unwrap();
            if projects.iter().any(|existing| existing == id) {
                return Ok(false);
            }
            projects.push(id.to_string());
            Ok(true)
        }

        fn remove(&self, id: &str) -> Result<bool, FetchError> {
            let mut projects = self.projects.lock().unwrap();
            let before = projects.len();
            projects.retain(|existing| existing != id);
            Ok(projects.len() != before)
        }
    }

    #[derive(Default)]
    struct FakeInventory {
        metadata_calls: AtomicUsize,
        instance_calls: AtomicUsize,
        names: Mutex<HashMap<String, String>>,
        denied: Mutex<HashSet<String>>,
        broken_metadata: Mutex<HashSet<String>>,
        instances: Mutex<HashMap<String, Vec<InstanceRecord>>>,
        failing_listings: Mutex<HashSet<String>>,
        gate: Mutex<Option<Arc<Notify>>>,
    }

    impl FakeInventory {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn set_name(&self, project: &str, name: &str) {
            self.names
                .lock()
                .unwrap()
                .insert(project.to_string(), name.to_string());
        }

        fn deny(&self, project: &str) {
            self.denied.lock().unwrap().insert(project.to_string());
        }

        fn break_metadata(&self, project: &str) {
            self.broken_metadata
                .lock()
                .unwrap()
                .insert(project.to_string());
        }

        fn fix_metadata(&self, project: &str) {
            self.broken_metadata.lock().unwrap().remove(project);
        }

        fn put_instances(&self, project: &str, records: Vec<InstanceRecord>) {
            self.instances
                .lock()
                .unwrap()
                .insert(project.to_string(), records);
        }

        fn fail_listings(&self, project: &str) {
            self.failing_listings
                .lock()
                .unwrap()
                .insert(project.to_string());
        }

        fn fix_listings(&self, project: &str) {
            self.failing_listings.lock().unwrap().remove(project);
        }

        fn hold_listings(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.gate.lock().unwrap() = Some(gate.clone());
            gate
        }

        fn clear_gate(&self) {
            *self.gate.lock().unwrap() = None;
        }
    }

    #[async_trait]
    impl ComputeInventory for FakeInventory {
        async fn project_metadata(&self, project: &str) -> Result<ProjectMetadata, FetchError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            if self.denied.lock().unwrap().contains(project) {
                return Err(FetchError::AccessDenied(project.to_string()));
            }
            if self.broken_metadata.lock().unwrap().contains(project) {
                return Err(FetchError::backend("metadata lookup failed"));
            }
            let display_name = self
                .names
                .lock()
                .unwrap()
                .get(project)
                .cloned()
                .unwrap_or_else(|| project.to_string());
            Ok(ProjectMetadata { display_name })
        }

        async fn list_instances(&self, project: &str) -> Result<Vec<InstanceRecord>, FetchError> {
            self.instance_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.failing_listings.lock().unwrap().contains(project) {
                return Err(FetchError::backend("instance listing failed"));
            }
            Ok(self
                .instances
                .lock()
                .unwrap()
                .get(project)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn record(name: &str, zone: &str, os: OsKind, status: InstanceStatus) -> InstanceRecord {
        InstanceRecord {
            id: format!("id-{name}"),
            name: name.to_string(),
            zone: zone.to_string(),
            os,
            status,
        }
    }

    fn tree_with(projects: &[&str], inventory: Arc<FakeInventory>) -> ResourceTree {
        let tracker = ConnectionTracker::new(Arc::new(NullBroker));
        ResourceTree::new(MemoryRegistry::with(projects), inventory, tracker)
    }

    fn labels(nodes: &[Node]) -> Vec<String> {
        nodes.iter().map(|node| node.display_text()).collect()
    }

    fn drain(receiver: &mut tokio::sync::broadcast::Receiver<TreeEvent>) -> Vec<TreeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    async fn load(tree: &ResourceTree, node: &Node) -> Vec<Node> {
        tree.children(node, false, &CancellationToken::new())
            .await
            .expect("load children")
    }

    #[tokio::test]
    async fn projects_sort_by_display_text_with_placeholders_in_place() {
        let inventory = FakeInventory::new();
        inventory.set_name("project-1", "[project-1]");
        inventory.deny("inaccessible-1");
        let tree = tree_with(&["project-2", "inaccessible-1", "project-1"], inventory);

        let projects = load(&tree, tree.root()).await;
        assert_eq!(
            labels(&projects),
            vec![
                "[project-1] (project-1)",
                "inaccessible project (inaccessible-1)",
                "project-2",
            ]
        );
    }

    #[tokio::test]
    async fn filter_changes_never_touch_the_backend() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![
                record("win-1", "us-central1-a", OsKind::Windows, InstanceStatus::Running),
                record("lin-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
            ],
        );
        let tree = tree_with(&["proj-a"], Arc::clone(&inventory));

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        let instances = load(&tree, &zones[0]).await;
        assert_eq!(labels(&instances), vec!["lin-1", "win-1"]);
        let calls_before = inventory.instance_calls.load(Ordering::SeqCst);

        tree.set_filter(InstanceFilter {
            show_windows: false,
            show_linux: true,
            name_pattern: String::new(),
        });
        let linux_only = tree.cached_children(&zones[0]).expect("cached");
        assert_eq!(labels(&linux_only), vec!["lin-1"]);

        tree.set_filter(InstanceFilter::default());
        let restored = load(&tree, &zones[0]).await;
        assert_eq!(restored.len(), 2);

        assert_eq!(inventory.instance_calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn name_pattern_matches_case_insensitively_from_cache() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![
                record("Web-Frontend", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
                record("db-backend", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
            ],
        );
        let tree = tree_with(&["proj-a"], Arc::clone(&inventory));
        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        load(&tree, &zones[0]).await;
        let calls_before = inventory.instance_calls.load(Ordering::SeqCst);

        tree.set_filter(InstanceFilter {
            name_pattern: "FRONT".to_string(),
            ..InstanceFilter::default()
        });
        let matched = tree.cached_children(&zones[0]).expect("cached");
        assert_eq!(labels(&matched), vec!["Web-Frontend"]);
        assert_eq!(inventory.instance_calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn zones_are_synthesized_from_one_listing_call() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![
                record("vm-1", "us-east1-b", OsKind::Linux, InstanceStatus::Running),
                record("vm-2", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
                record("vm-3", "us-central1-a", OsKind::Windows, InstanceStatus::Stopped),
            ],
        );
        let tree = tree_with(&["proj-a"], Arc::clone(&inventory));

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        assert_eq!(labels(&zones), vec!["us-central1-a", "us-east1-b"]);
        assert_eq!(inventory.instance_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn instances_belong_to_their_zone_and_sort_by_name() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![
                record("vm-b", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
                record("vm-elsewhere", "us-east1-b", OsKind::Linux, InstanceStatus::Running),
                record("vm-a", "us-central1-a", OsKind::Windows, InstanceStatus::Stopped),
            ],
        );
        let tree = tree_with(&["proj-a"], inventory);

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        let central = zones
            .iter()
            .find(|zone| zone.display_text() == "us-central1-a")
            .expect("zone");
        let instances = load(&tree, central).await;
        assert_eq!(labels(&instances), vec!["vm-a", "vm-b"]);
    }

    #[tokio::test]
    async fn inaccessible_project_has_no_children_and_no_backend_call() {
        let inventory = FakeInventory::new();
        inventory.deny("locked-down");
        let tree = tree_with(&["locked-down"], Arc::clone(&inventory));

        let projects = load(&tree, tree.root()).await;
        assert!(!projects[0].can_expand());
        let children = load(&tree, &projects[0]).await;
        assert!(children.is_empty());
        assert_eq!(inventory.instance_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn each_replacement_publishes_exactly_one_reset() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running)],
        );
        let tree = tree_with(&["proj-a"], inventory);
        let mut events = tree.subscribe();

        let projects = load(&tree, tree.root()).await;
        assert_eq!(drain(&mut events), vec![TreeEvent::ChildrenReset(NodeRef::Root)]);

        let zones = load(&tree, &projects[0]).await;
        assert_eq!(
            drain(&mut events),
            vec![TreeEvent::ChildrenReset(NodeRef::Project("proj-a".into()))]
        );

        load(&tree, &zones[0]).await;
        assert_eq!(
            drain(&mut events),
            vec![TreeEvent::ChildrenReset(NodeRef::Zone(ZoneLocator::new(
                "proj-a",
                "us-central1-a"
            )))]
        );

        // cached reads, filter changes, and invalidation publish nothing
        load(&tree, tree.root()).await;
        tree.set_filter(InstanceFilter::default());
        tree.invalidate(&zones[0]);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn refresh_true_reflects_registry_changes() {
        let inventory = FakeInventory::new();
        let registry = MemoryRegistry::with(&["proj-a"]);
        let tracker = ConnectionTracker::new(Arc::new(NullBroker));
        let tree = ResourceTree::new(
            registry.clone(),
            Arc::clone(&inventory) as Arc<dyn ComputeInventory>,
            tracker,
        );

        assert_eq!(load(&tree, tree.root()).await.len(), 1);

        registry.add("proj-b").expect("add");
        tree.refresh(true);
        assert!(tree.cached_children(tree.root()).is_none());
        assert_eq!(load(&tree, tree.root()).await.len(), 2);
    }

    #[tokio::test]
    async fn refresh_false_keeps_projects_and_reloads_zone_collections() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running)],
        );
        let tree = tree_with(&["proj-a"], Arc::clone(&inventory));
        let mut events = tree.subscribe();

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        load(&tree, &zones[0]).await;
        let metadata_before = inventory.metadata_calls.load(Ordering::SeqCst);
        drain(&mut events);

        tree.refresh(false);
        assert!(drain(&mut events).is_empty());
        // project collection untouched, zone subtree dropped
        assert_eq!(tree.cached_children(tree.root()).expect("projects").len(), 1);
        assert!(tree.cached_children(&projects[0]).is_none());

        let reloaded = load(&tree, &projects[0]).await;
        assert_eq!(labels(&reloaded), vec!["us-central1-a"]);
        assert_eq!(
            drain(&mut events),
            vec![TreeEvent::ChildrenReset(NodeRef::Project("proj-a".into()))]
        );
        assert_eq!(inventory.metadata_calls.load(Ordering::SeqCst), metadata_before);
    }

    #[tokio::test]
    async fn refresh_scopes_map_to_targeted_invalidations() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![
                record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
                record("vm-2", "us-east1-b", OsKind::Linux, InstanceStatus::Running),
            ],
        );
        let tree = tree_with(&["proj-a"], inventory);

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        load(&tree, &zones[0]).await;
        load(&tree, &zones[1]).await;

        // instance-selected refresh drops exactly that instance's parent zone
        tree.apply_refresh(&RefreshScope::InstancesOf(ZoneLocator::new(
            "proj-a",
            "us-central1-a",
        )));
        assert!(tree.cached_children(&zones[0]).is_none());
        assert!(tree.cached_children(&zones[1]).is_some());

        // scopes for identities no longer loaded are ignored
        tree.apply_refresh(&RefreshScope::ZonesOf("ghost".into()));
        tree.apply_refresh(&RefreshScope::InstancesOf(ZoneLocator::new(
            "ghost",
            "us-central1-a",
        )));
        assert!(tree.cached_children(tree.root()).is_some());

        tree.apply_refresh(&RefreshScope::AllProjects);
        assert!(tree.cached_children(tree.root()).is_none());
    }

    #[tokio::test]
    async fn concurrent_children_calls_share_one_backend_call() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running)],
        );
        let tree = Arc::new(tree_with(&["proj-a"], Arc::clone(&inventory)));

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        let calls_before = inventory.instance_calls.load(Ordering::SeqCst);

        let gate = inventory.hold_listings();
        let zone = zones[0].clone();
        let first = {
            let tree = Arc::clone(&tree);
            let zone = zone.clone();
            tokio::spawn(async move {
                tree.children(&zone, true, &CancellationToken::new()).await
            })
        };
        let second = {
            let tree = Arc::clone(&tree);
            let zone = zone.clone();
            tokio::spawn(async move {
                tree.children(&zone, true, &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        let first = timeout(TEST_TIMEOUT, first).await.expect("join").expect("task");
        let second = timeout(TEST_TIMEOUT, second).await.expect("join").expect("task");
        assert_eq!(first.expect("first").len(), 1);
        assert_eq!(second.expect("second").len(), 1);
        assert_eq!(inventory.instance_calls.load(Ordering::SeqCst), calls_before + 1);
    }

    #[tokio::test]
    async fn a_joiner_survives_the_initiators_cancellation() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running)],
        );
        let tree = Arc::new(tree_with(&["proj-a"], Arc::clone(&inventory)));

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;

        let gate = inventory.hold_listings();
        let initiator_cancel = CancellationToken::new();
        let initiator = {
            let tree = Arc::clone(&tree);
            let zone = zones[0].clone();
            let cancel = initiator_cancel.clone();
            tokio::spawn(async move { tree.children(&zone, true, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let joiner = {
            let tree = Arc::clone(&tree);
            let zone = zones[0].clone();
            tokio::spawn(async move {
                tree.children(&zone, true, &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // with the listing still gated the initiator can only end cancelled
        initiator_cancel.cancel();
        let initiator = timeout(TEST_TIMEOUT, initiator).await.expect("join").expect("task");
        assert!(matches!(initiator, Err(FetchError::Cancelled)));

        gate.notify_one();
        inventory.clear_gate();
        let joiner = timeout(TEST_TIMEOUT, joiner).await.expect("join").expect("task");
        assert_eq!(joiner.expect("joiner").len(), 1);
    }

    #[tokio::test]
    async fn cancelling_an_inflight_fetch_keeps_the_stale_view() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![
                record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
                record("vm-2", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
            ],
        );
        let tree = tree_with(&["proj-a"], Arc::clone(&inventory));
        let mut events = tree.subscribe();

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        assert_eq!(load(&tree, &zones[0]).await.len(), 2);
        drain(&mut events);

        inventory.put_instances(
            "proj-a",
            vec![
                record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
                record("vm-2", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
                record("vm-3", "us-central1-a", OsKind::Linux, InstanceStatus::Running),
            ],
        );
        let _gate = inventory.hold_listings();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tree.children(&zones[0], true, &cancel).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));

        // stale view intact, nothing published
        assert_eq!(tree.cached_children(&zones[0]).expect("stale").len(), 2);
        assert!(drain(&mut events).is_empty());

        // a fresh request succeeds and lands the new listing
        inventory.clear_gate();
        let reloaded = tree
            .children(&zones[0], true, &CancellationToken::new())
            .await
            .expect("reload");
        assert_eq!(reloaded.len(), 3);
    }

    #[tokio::test]
    async fn backend_failure_leaves_previous_children_intact() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running)],
        );
        let tree = tree_with(&["proj-a"], Arc::clone(&inventory));
        let mut events = tree.subscribe();

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        assert_eq!(load(&tree, &zones[0]).await.len(), 1);
        drain(&mut events);

        inventory.fail_listings("proj-a");
        let result = tree.children(&zones[0], true, &CancellationToken::new()).await;
        assert!(matches!(result, Err(FetchError::Backend(_))));
        assert_eq!(tree.cached_children(&zones[0]).expect("stale").len(), 1);
        assert!(drain(&mut events).is_empty());

        inventory.fix_listings("proj-a");
        assert_eq!(
            tree.children(&zones[0], true, &CancellationToken::new())
                .await
                .expect("retry")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn metadata_backend_error_fails_the_whole_root_fetch() {
        let inventory = FakeInventory::new();
        inventory.break_metadata("proj-b");
        let tree = tree_with(&["proj-a", "proj-b"], Arc::clone(&inventory));

        let result = tree
            .children(tree.root(), false, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(FetchError::Backend(_))));
        assert!(tree.cached_children(tree.root()).is_none());

        inventory.fix_metadata("proj-b");
        assert_eq!(load(&tree, tree.root()).await.len(), 2);
    }

    #[tokio::test]
    async fn removing_an_untracked_project_is_unknown_identity() {
        let inventory = FakeInventory::new();
        let tree = tree_with(&["proj-a"], inventory);
        load(&tree, tree.root()).await;

        let error = tree.remove_project("ghost").expect_err("untracked");
        assert!(matches!(error, FetchError::UnknownIdentity(_)));
        // view untouched by the failed removal
        assert_eq!(tree.cached_children(tree.root()).expect("projects").len(), 1);

        tree.remove_project("proj-a").expect("tracked");
        assert!(tree.cached_children(tree.root()).is_none());
        assert!(load(&tree, tree.root()).await.is_empty());
    }

    #[tokio::test]
    async fn add_project_invalidates_root_and_ignores_duplicates() {
        let inventory = FakeInventory::new();
        let tree = tree_with(&["proj-a"], inventory);
        assert_eq!(load(&tree, tree.root()).await.len(), 1);

        assert!(tree.add_project("proj-b").expect("add"));
        assert!(tree.cached_children(tree.root()).is_none());
        assert_eq!(load(&tree, tree.root()).await.len(), 2);

        assert!(!tree.add_project("proj-b").expect("duplicate"));
        assert!(tree.cached_children(tree.root()).is_some());
    }

    #[tokio::test]
    async fn invalidation_forgets_descendant_connection_state() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running)],
        );
        let tracker = ConnectionTracker::new(Arc::new(NullBroker));
        let tree = ResourceTree::new(
            MemoryRegistry::with(&["proj-a"]),
            inventory,
            tracker.clone(),
        );

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        load(&tree, &zones[0]).await;

        let vm = InstanceLocator::new("proj-a", "us-central1-a", "vm-1");
        tracker.apply(SessionEvent::Started(vm.clone()));
        assert!(tree.is_connected(&vm));

        // dropping the project subtree deregisters the instance two levels down
        tree.invalidate(&projects[0]);
        assert!(!tree.is_connected(&vm));
        tracker.apply(SessionEvent::Started(vm.clone()));
        assert!(!tree.is_connected(&vm));
    }

    #[tokio::test]
    async fn reload_reseeds_connection_state_from_the_broker() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running)],
        );
        let tracker = ConnectionTracker::new(Arc::new(NullBroker));
        let tree = ResourceTree::new(
            MemoryRegistry::with(&["proj-a"]),
            Arc::clone(&inventory) as Arc<dyn ComputeInventory>,
            tracker.clone(),
        );

        let projects = load(&tree, tree.root()).await;
        let zones = load(&tree, &projects[0]).await;
        load(&tree, &zones[0]).await;

        let vm = InstanceLocator::new("proj-a", "us-central1-a", "vm-1");
        tracker.apply(SessionEvent::Started(vm.clone()));
        assert!(tree.is_connected(&vm));

        tree.children(&zones[0], true, &CancellationToken::new())
            .await
            .expect("reload");
        assert!(!tree.is_connected(&vm));
    }

    #[tokio::test]
    async fn find_node_walks_loaded_children_only() {
        let inventory = FakeInventory::new();
        inventory.put_instances(
            "proj-a",
            vec![record("vm-1", "us-central1-a", OsKind::Linux, InstanceStatus::Running)],
        );
        let tree = tree_with(&["proj-a"], inventory);

        let zone_ref = NodeRef::Zone(ZoneLocator::new("proj-a", "us-central1-a"));
        assert!(tree.find_node(&zone_ref).is_none());

        let projects = load(&tree, tree.root()).await;
        load(&tree, &projects[0]).await;
        assert!(tree.find_node(&zone_ref).is_some());
        assert!(
            tree.find_node(&NodeRef::Project("proj-a".into()))
                .is_some()
        );
        assert!(tree.find_node(&NodeRef::Project("ghost".into())).is_none());
    }
}
