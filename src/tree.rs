/// Data Tree and Diff Algebra
///
/// This module is the in-crate realization of the schema/data library's tree
/// type: a forest of nodes carrying module, name, value, list keys,
/// config/state classification, default flag, and optional origin metadata.
/// The same node type backs plain data trees, diff trees (per-node diff
/// operation plus the replaced value), and edit trees (per-node edit
/// operation plus an optional move anchor for user-ordered lists).
///
/// The merge entry points accept an injected policy so callers can choose
/// between plain last-write-wins and the origin-aware semantics used for
/// operational overlays.
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::xpath::{Predicate, Step, XPath};

/// Effective origin of an operational node, per the standard origin set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Config,
    Oper,
    Intended,
    Dynamic,
    System,
    Learned,
    Default,
    Unknown,
}

impl Origin {
    pub fn as_uri(&self) -> &'static str {
        match self {
            Origin::Config => "ietf-origin:config",
            Origin::Oper => "ietf-origin:oper",
            Origin::Intended => "ietf-origin:intended",
            Origin::Dynamic => "ietf-origin:dynamic",
            Origin::System => "ietf-origin:system",
            Origin::Learned => "ietf-origin:learned",
            Origin::Default => "ietf-origin:default",
            Origin::Unknown => "ietf-origin:unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Container,
    List,
    Leaf,
    LeafList,
}

/// Per-node operation in a diff tree. `None` marks containers that only
/// carry changed descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiffOp {
    None,
    Create,
    Delete,
    Replace,
    /// A user-ordered list instance changed position. Folds to `merge` in
    /// change notifications.
    Move,
}

/// Per-node operation in an edit tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOp {
    /// Create if missing, update otherwise.
    Merge,
    /// Fail with `Exists` when the node is already present.
    Create,
    /// Replace the whole subtree.
    Replace,
    /// Fail with `NotFound` when the node is absent.
    Delete,
    /// Delete if present, no-op otherwise.
    Remove,
}

/// Anchor for moving an instance of a user-ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveAnchor {
    First,
    Last,
    /// Move before the instance with the given key values.
    Before(Vec<(String, String)>),
    /// Move after the instance with the given key values.
    After(Vec<(String, String)>),
}

/// A single data node. Children are ordered; list-instance identity is the
/// (module, name, keys) triple, leaf-list identity additionally includes the
/// value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub module: String,
    pub name: String,
    pub kind: NodeKind,
    pub value: Option<String>,
    pub keys: Vec<(String, String)>,
    pub config: bool,
    pub dflt: bool,
    pub origin: Option<Origin>,
    pub owner_cid: Option<u32>,
    pub diff_op: DiffOp,
    pub prev_value: Option<String>,
    pub edit_op: Option<EditOp>,
    pub insert: Option<MoveAnchor>,
    pub children: Vec<Node>,
}

impl Node {
    fn base(module: &str, name: &str, kind: NodeKind) -> Node {
        Node {
            module: module.to_string(),
            name: name.to_string(),
            kind,
            value: None,
            keys: Vec::new(),
            config: true,
            dflt: false,
            origin: None,
            owner_cid: None,
            diff_op: DiffOp::None,
            prev_value: None,
            edit_op: None,
            insert: None,
            children: Vec::new(),
        }
    }

    pub fn container(module: &str, name: &str) -> Node {
        Node::base(module, name, NodeKind::Container)
    }

    pub fn list(module: &str, name: &str, keys: &[(&str, &str)]) -> Node {
        let mut node = Node::base(module, name, NodeKind::List);
        node.keys = keys.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        node
    }

    pub fn leaf(module: &str, name: &str, value: &str) -> Node {
        let mut node = Node::base(module, name, NodeKind::Leaf);
        node.value = Some(value.to_string());
        node
    }

    pub fn leaf_list(module: &str, name: &str, value: &str) -> Node {
        let mut node = Node::base(module, name, NodeKind::LeafList);
        node.value = Some(value.to_string());
        node
    }

    pub fn with_child(mut self, child: Node) -> Node {
        self.children.push(child);
        self
    }

    pub fn with_config(mut self, config: bool) -> Node {
        self.config = config;
        self
    }

    pub fn with_op(mut self, op: EditOp) -> Node {
        self.edit_op = Some(op);
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Node {
        self.origin = Some(origin);
        self
    }

    pub fn with_owner(mut self, cid: u32) -> Node {
        self.owner_cid = Some(cid);
        self
    }

    /// Whether `other` denotes the same data instance.
    pub fn same_identity(&self, other: &Node) -> bool {
        if self.module != other.module || self.name != other.name {
            return false;
        }
        match self.kind {
            NodeKind::List => self.keys == other.keys,
            NodeKind::LeafList => self.value == other.value,
            _ => true,
        }
    }

    /// One path segment for this node, e.g. `name[key='v']`.
    pub fn path_segment(&self) -> String {
        let mut seg = format!("{}:{}", self.module, self.name);
        for (k, v) in &self.keys {
            seg.push_str(&format!("[{}='{}']", k, v));
        }
        if self.kind == NodeKind::LeafList {
            if let Some(v) = &self.value {
                seg.push_str(&format!("[.='{}']", v));
            }
        }
        seg
    }

    /// Copy of this node without children.
    pub fn clone_shallow(&self) -> Node {
        let mut copy = self.clone();
        copy.children = Vec::new();
        copy
    }

    fn matches_name(&self, step: &Step, inherited_module: Option<&str>) -> bool {
        if step.name != "*" && step.name != self.name {
            return false;
        }
        let effective = step.module.as_deref().or(inherited_module);
        match effective {
            Some(m) => m == self.module,
            None => true,
        }
    }

    fn matches_predicates(&self, step: &Step, position: usize) -> bool {
        for pred in &step.predicates {
            match pred {
                Predicate::KeyEq { key, value } => {
                    if !self.keys.iter().any(|(k, v)| k == key && v == value) {
                        return false;
                    }
                }
                Predicate::Position(p) => {
                    if *p != position {
                        return false;
                    }
                }
                Predicate::Other(_) => {}
            }
        }
        true
    }

    /// Strip diff/edit metadata from the subtree, yielding plain data.
    pub fn into_data(mut self) -> Node {
        self.diff_op = DiffOp::None;
        self.prev_value = None;
        self.edit_op = None;
        self.insert = None;
        self.children = self.children.into_iter().map(Node::into_data).collect();
        self
    }
}

/// Policy invoked when a merge finds an existing node with the same identity.
pub trait MergePolicy {
    fn on_match(&self, src: &Node, dst: &mut Node);
}

/// Plain merge: the incoming node wins wholesale.
pub struct LastWins;

impl MergePolicy for LastWins {
    fn on_match(&self, src: &Node, dst: &mut Node) {
        dst.value = src.value.clone();
        dst.dflt = src.dflt;
        dst.origin = src.origin;
        dst.owner_cid = src.owner_cid;
    }
}

/// Origin-aware merge used for operational overlays: an incoming node with no
/// explicit origin keeps the target's; when both carry one the incoming wins.
/// Ownership follows the incoming connection id when present.
pub struct OriginAware;

impl MergePolicy for OriginAware {
    fn on_match(&self, src: &Node, dst: &mut Node) {
        dst.value = src.value.clone();
        dst.dflt = src.dflt;
        if src.origin.is_some() {
            dst.origin = src.origin;
        }
        if src.owner_cid.is_some() {
            dst.owner_cid = src.owner_cid;
        }
    }
}

/// A forest of data nodes, possibly spanning several modules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub roots: Vec<Node>,
}

impl Tree {
    pub fn new() -> Tree {
        Tree { roots: Vec::new() }
    }

    pub fn with_root(node: Node) -> Tree {
        Tree { roots: vec![node] }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Iterate top-level nodes belonging to `module`.
    pub fn module_roots<'a>(&'a self, module: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.roots.iter().filter(move |n| n.module == module)
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.roots.iter().any(|n| n.module == module)
    }

    /// Detach all top-level nodes of `module` into their own tree.
    pub fn take_module(&mut self, module: &str) -> Tree {
        let mut taken = Vec::new();
        let mut kept = Vec::new();
        for node in self.roots.drain(..) {
            if node.module == module {
                taken.push(node);
            } else {
                kept.push(node);
            }
        }
        self.roots = kept;
        Tree { roots: taken }
    }

    /// Clone of the top-level nodes of `module`.
    pub fn module_data(&self, module: &str) -> Tree {
        Tree {
            roots: self.module_roots(module).cloned().collect(),
        }
    }

    /// Distinct module names present at the top level, in first-seen order.
    pub fn modules(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for node in &self.roots {
            if !out.iter().any(|m| *m == node.module) {
                out.push(node.module.clone());
            }
        }
        out
    }

    /// Re-attach a detached module tree.
    pub fn attach(&mut self, tree: Tree) {
        self.roots.extend(tree.roots);
    }

    /// Evaluate an xpath, returning references to every matching node.
    pub fn eval<'a>(&'a self, path: &XPath) -> Vec<&'a Node> {
        let mut out = Vec::new();
        eval_steps(&self.roots, path.steps(), 0, None, &mut out);
        out
    }

    /// Copy every subtree matched by `path` together with its chain of
    /// parents. Sibling matches under a common parent are merged into one
    /// parent shell.
    pub fn select_with_parents(&self, path: &XPath) -> Tree {
        let selected = select_steps(&self.roots, path.steps(), 0, None);
        let mut out = Tree::new();
        out.merge(Tree { roots: selected }, &LastWins);
        out
    }

    /// Remove every subtree matched by `path`. Emptied parent shells are
    /// kept; they still carry presence information.
    pub fn remove(&mut self, path: &XPath) {
        remove_steps(&mut self.roots, path.steps(), 0, None);
    }

    /// Merge `src` into `self` with the supplied policy.
    pub fn merge(&mut self, src: Tree, policy: &dyn MergePolicy) {
        for node in src.roots {
            merge_node(&mut self.roots, node, policy);
        }
    }

    /// Remove every node owned by connection `cid`, pruning parents that end
    /// up with no children and no operation of their own.
    pub fn retain_not_owned(&mut self, cid: u32) {
        retain_not_owned(&mut self.roots, cid);
    }

    /// Remove all state (`config false`) subtrees.
    pub fn trim_state(&mut self) {
        self.roots.retain(|n| n.config);
        for node in &mut self.roots {
            trim_state_rec(node);
        }
    }

    /// Remove config leaves, then config containers left childless.
    pub fn trim_config(&mut self) {
        for node in &mut self.roots {
            trim_config_rec(node);
        }
        self.roots.retain(|n| {
            !(n.config && matches!(n.kind, NodeKind::Leaf | NodeKind::LeafList))
                && !(n.config && n.children.is_empty() && matches!(n.kind, NodeKind::Container))
        });
    }

    /// Drop all origin metadata.
    pub fn strip_origin(&mut self) {
        for node in &mut self.roots {
            strip_origin_rec(node);
        }
    }

    /// Stamp unannotated leaves with `config`/`oper` origin; default leaves
    /// get the `default` origin.
    pub fn stamp_origin(&mut self) {
        for node in &mut self.roots {
            stamp_origin_rec(node);
        }
    }

    /// Native binary serialization.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| {
            crate::error::StoreError::new(
                crate::error::ErrorKind::Internal,
                format!("tree serialization failed: {}", e),
            )
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Tree> {
        bincode::deserialize(bytes).map_err(|e| {
            crate::error::StoreError::new(
                crate::error::ErrorKind::Internal,
                format!("tree deserialization failed: {}", e),
            )
        })
    }

    /// Compute the diff turning `old` into `new`.
    pub fn diff(old: &Tree, new: &Tree) -> Tree {
        Tree {
            roots: diff_children(&old.roots, &new.roots),
        }
    }

    /// Apply a diff tree to this data tree.
    pub fn apply_diff(&mut self, diff: &Tree) {
        for d in &diff.roots {
            apply_diff_node(&mut self.roots, d);
        }
    }

    /// Merge `src` diff into `dst` diff, combining per-node operations.
    /// Value/origin resolution on coinciding nodes follows `policy`.
    pub fn diff_merge(dst: &mut Tree, src: Tree, policy: &dyn MergePolicy) {
        for node in src.roots {
            diff_merge_node(&mut dst.roots, node, policy);
        }
    }

    /// Re-base a stored operational diff against new running data, dropping
    /// entries that became no-ops: deletions of nodes that are gone and
    /// creations of nodes running now contains with the same value.
    pub fn diff_mod_update(stored: &mut Tree, running: &Tree) {
        diff_mod_update_children(&mut stored.roots, Some(&running.roots));
    }
}

fn eval_steps<'a>(
    nodes: &'a [Node],
    steps: &[Step],
    idx: usize,
    inherited: Option<&str>,
    out: &mut Vec<&'a Node>,
) {
    if idx >= steps.len() {
        return;
    }
    let step = &steps[idx];

    if step.descendant {
        // Match this step at any depth starting from `nodes`.
        eval_descendant(nodes, steps, idx, inherited, out);
        return;
    }

    let mut position = 0;
    for node in nodes {
        if !node.matches_name(step, inherited) {
            continue;
        }
        position += 1;
        if !node.matches_predicates(step, position) {
            continue;
        }
        if idx + 1 == steps.len() {
            out.push(node);
        } else {
            eval_steps(&node.children, steps, idx + 1, Some(&node.module), out);
        }
    }
}

fn eval_descendant<'a>(
    nodes: &'a [Node],
    steps: &[Step],
    idx: usize,
    inherited: Option<&str>,
    out: &mut Vec<&'a Node>,
) {
    let step = &steps[idx];
    let mut position = 0;
    for node in nodes {
        if node.matches_name(step, inherited) {
            position += 1;
            if node.matches_predicates(step, position) {
                if idx + 1 == steps.len() {
                    out.push(node);
                } else {
                    eval_steps(&node.children, steps, idx + 1, Some(&node.module), out);
                }
            }
        }
        eval_descendant(&node.children, steps, idx, Some(&node.module), out);
    }
}

fn select_steps(nodes: &[Node], steps: &[Step], idx: usize, inherited: Option<&str>) -> Vec<Node> {
    if idx >= steps.len() {
        return Vec::new();
    }
    let step = &steps[idx];
    let mut out = Vec::new();
    let mut position = 0;

    for node in nodes {
        let name_ok = node.matches_name(step, inherited);
        if name_ok {
            position += 1;
        }
        if step.descendant {
            if name_ok && node.matches_predicates(step, position) {
                if idx + 1 == steps.len() {
                    out.push(node.clone());
                    continue;
                }
                let kids = select_steps(&node.children, steps, idx + 1, Some(&node.module));
                if !kids.is_empty() {
                    let mut shell = node.clone_shallow();
                    shell.children = kids;
                    out.push(shell);
                    continue;
                }
            }
            let kids = select_steps(&node.children, steps, idx, Some(&node.module));
            if !kids.is_empty() {
                let mut shell = node.clone_shallow();
                shell.children = kids;
                out.push(shell);
            }
        } else if name_ok && node.matches_predicates(step, position) {
            if idx + 1 == steps.len() {
                out.push(node.clone());
            } else {
                let kids = select_steps(&node.children, steps, idx + 1, Some(&node.module));
                if !kids.is_empty() {
                    let mut shell = node.clone_shallow();
                    shell.children = kids;
                    out.push(shell);
                }
            }
        }
    }
    out
}

fn remove_steps(nodes: &mut Vec<Node>, steps: &[Step], idx: usize, inherited: Option<&str>) {
    if idx >= steps.len() {
        return;
    }
    let step = &steps[idx];
    let last = idx + 1 == steps.len();

    if last {
        let mut position = 0;
        nodes.retain(|node| {
            if !node.matches_name(step, inherited) {
                return true;
            }
            position += 1;
            !node.matches_predicates(step, position)
        });
    }

    let mut position = 0;
    for node in nodes.iter_mut() {
        let module = node.module.clone();
        let name_ok = node.matches_name(step, inherited);
        if name_ok {
            position += 1;
        }
        if !last && name_ok && node.matches_predicates(step, position) {
            remove_steps(&mut node.children, steps, idx + 1, Some(&module));
        }
        if step.descendant {
            // A descendant step also matches at any greater depth.
            remove_steps(&mut node.children, steps, idx, Some(&module));
        }
    }
}

fn merge_node(dst: &mut Vec<Node>, src: Node, policy: &dyn MergePolicy) {
    match dst.iter_mut().find(|d| d.same_identity(&src)) {
        Some(existing) => {
            policy.on_match(&src, existing);
            for child in src.children {
                merge_node(&mut existing.children, child, policy);
            }
        }
        None => dst.push(src),
    }
}

fn retain_not_owned(nodes: &mut Vec<Node>, cid: u32) {
    nodes.retain(|n| n.owner_cid != Some(cid));
    for node in nodes.iter_mut() {
        retain_not_owned(&mut node.children, cid);
    }
    nodes.retain(|n| {
        !(n.children.is_empty()
            && n.diff_op == DiffOp::None
            && matches!(n.kind, NodeKind::Container)
            && n.owner_cid.is_none()
            && n.origin.is_none())
    });
}

fn trim_state_rec(node: &mut Node) {
    node.children.retain(|c| c.config);
    for child in &mut node.children {
        trim_state_rec(child);
    }
}

fn trim_config_rec(node: &mut Node) {
    for child in &mut node.children {
        trim_config_rec(child);
    }
    node.children.retain(|c| {
        !(c.config && matches!(c.kind, NodeKind::Leaf | NodeKind::LeafList))
            && !(c.config && c.children.is_empty() && matches!(c.kind, NodeKind::Container))
    });
}

fn strip_origin_rec(node: &mut Node) {
    node.origin = None;
    for child in &mut node.children {
        strip_origin_rec(child);
    }
}

fn stamp_origin_rec(node: &mut Node) {
    if matches!(node.kind, NodeKind::Leaf | NodeKind::LeafList) {
        if node.dflt {
            node.origin = Some(Origin::Default);
        } else if node.origin.is_none() {
            node.origin = Some(if node.config { Origin::Config } else { Origin::Oper });
        }
    }
    for child in &mut node.children {
        stamp_origin_rec(child);
    }
}

fn diff_children(old: &[Node], new: &[Node]) -> Vec<Node> {
    let mut out = Vec::new();

    for o in old {
        if !new.iter().any(|n| n.same_identity(o)) {
            out.push(mark_subtree(o.clone(), DiffOp::Delete));
        }
    }
    for n in new {
        match old.iter().find(|o| o.same_identity(n)) {
            None => out.push(mark_subtree(n.clone(), DiffOp::Create)),
            Some(o) => {
                let value_changed = matches!(n.kind, NodeKind::Leaf) && o.value != n.value;
                let kids = diff_children(&o.children, &n.children);
                if value_changed {
                    let mut d = n.clone_shallow();
                    d.diff_op = DiffOp::Replace;
                    d.prev_value = o.value.clone();
                    d.children = kids;
                    out.push(d);
                } else if !kids.is_empty() {
                    let mut d = n.clone_shallow();
                    d.diff_op = DiffOp::None;
                    d.children = kids;
                    out.push(d);
                }
            }
        }
    }
    out
}

fn mark_subtree(mut node: Node, op: DiffOp) -> Node {
    node.diff_op = op;
    node.children = node
        .children
        .into_iter()
        .map(|c| mark_subtree(c, op))
        .collect();
    node
}

fn apply_diff_node(children: &mut Vec<Node>, d: &Node) {
    match d.diff_op {
        DiffOp::Delete => {
            children.retain(|c| !c.same_identity(d));
        }
        DiffOp::Create => match children.iter_mut().find(|c| c.same_identity(d)) {
            Some(existing) => {
                existing.value = d.value.clone();
                existing.dflt = d.dflt;
                if d.origin.is_some() {
                    existing.origin = d.origin;
                }
                for child in &d.children {
                    apply_diff_node(&mut existing.children, child);
                }
            }
            None => children.push(d.clone().into_data_keep_origin()),
        },
        DiffOp::Replace => match children.iter_mut().find(|c| c.same_identity(d)) {
            Some(existing) => {
                existing.value = d.value.clone();
                existing.dflt = d.dflt;
                if d.origin.is_some() {
                    existing.origin = d.origin;
                }
                for child in &d.children {
                    apply_diff_node(&mut existing.children, child);
                }
            }
            None => children.push(d.clone().into_data_keep_origin()),
        },
        DiffOp::Move | DiffOp::None => {
            match children.iter_mut().find(|c| c.same_identity(d)) {
                Some(existing) => {
                    for child in &d.children {
                        apply_diff_node(&mut existing.children, child);
                    }
                }
                None => {
                    // Recreate the container shell the diff descends through.
                    let mut shell = d.clone_shallow().into_data_keep_origin();
                    for child in &d.children {
                        apply_diff_node(&mut shell.children, child);
                    }
                    children.push(shell);
                }
            }
        }
    }
}

impl Node {
    /// Like `into_data` but preserves origin/owner annotations, which stored
    /// operational overlays rely on.
    fn into_data_keep_origin(mut self) -> Node {
        self.diff_op = DiffOp::None;
        self.prev_value = None;
        self.edit_op = None;
        self.insert = None;
        self.children = self
            .children
            .into_iter()
            .map(Node::into_data_keep_origin)
            .collect();
        self
    }
}

fn diff_merge_node(dst: &mut Vec<Node>, src: Node, policy: &dyn MergePolicy) {
    match dst.iter_mut().position(|d| d.same_identity(&src)) {
        None => dst.push(src),
        Some(i) => {
            let combined = combine_ops(dst[i].diff_op, src.diff_op);
            match combined {
                None => {
                    // The operations cancel (create followed by delete).
                    dst.remove(i);
                }
                Some(op) => {
                    let existing = &mut dst[i];
                    let keep_prev = existing.prev_value.clone();
                    policy.on_match(&src, existing);
                    existing.diff_op = op;
                    if op == DiffOp::Replace {
                        // The earliest replaced value is the true "previous".
                        existing.prev_value = keep_prev.or(src.prev_value.clone());
                    }
                    for child in src.children {
                        diff_merge_node(&mut existing.children, child, policy);
                    }
                }
            }
        }
    }
}

/// Combine a prior diff op with a subsequent one on the same node. `None`
/// means the node drops out of the diff entirely.
fn combine_ops(first: DiffOp, second: DiffOp) -> Option<DiffOp> {
    match (first, second) {
        (DiffOp::Create, DiffOp::Delete) => None,
        (DiffOp::Create, _) => Some(DiffOp::Create),
        (DiffOp::Delete, DiffOp::Create) => Some(DiffOp::Replace),
        (DiffOp::Replace, DiffOp::Delete) => Some(DiffOp::Delete),
        (DiffOp::None, op) => Some(op),
        (op, DiffOp::None) => Some(op),
        (_, second) => Some(second),
    }
}

fn diff_mod_update_children(stored: &mut Vec<Node>, running: Option<&[Node]>) {
    stored.retain(|d| {
        let present = running
            .map(|r| r.iter().any(|n| n.same_identity(d)))
            .unwrap_or(false);
        match d.diff_op {
            DiffOp::Delete => present,
            DiffOp::Create => {
                // Creation running already contains with the same value is a
                // no-op now.
                !(present
                    && running
                        .and_then(|r| r.iter().find(|n| n.same_identity(d)))
                        .map(|n| n.value == d.value)
                        .unwrap_or(false))
            }
            _ => true,
        }
    });
    for d in stored.iter_mut() {
        let sub = running.and_then(|r| r.iter().find(|n| n.same_identity(d)));
        diff_mod_update_children(&mut d.children, sub.map(|n| n.children.as_slice()));
    }
}
