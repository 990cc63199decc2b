/// Schema Registry Module
///
/// Process-local knowledge about installed modules: node kinds, config/state
/// classification, mandatory flags, defaults, leafref targets, and list keys.
/// The SHM registry stores what must be shared between processes (names,
/// dependency arrays, subscriptions); everything that only drives validation
/// and default materialization lives here and is fed to the connection at
/// install time.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::tree::{Node, NodeKind, Tree};
use crate::xpath::XPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaNodeKind {
    Container,
    PresenceContainer,
    List,
    Leaf,
    LeafList,
    Rpc,
    Notification,
}

/// One schema node, addressed by its module-relative schema path
/// (`/interfaces/interface/oper-state`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSchema {
    pub path: String,
    pub kind: SchemaNodeKind,
    pub config: bool,
    pub mandatory: bool,
    pub default: Option<String>,
    /// Absolute xpath of the leafref target, possibly in another module.
    pub leafref: Option<String>,
    pub keys: Vec<String>,
    pub user_ordered: bool,
}

impl NodeSchema {
    pub fn new(path: &str, kind: SchemaNodeKind) -> NodeSchema {
        NodeSchema {
            path: path.to_string(),
            kind,
            config: true,
            mandatory: false,
            default: None,
            leafref: None,
            keys: Vec::new(),
            user_ordered: false,
        }
    }

    pub fn state(mut self) -> NodeSchema {
        self.config = false;
        self
    }

    pub fn mandatory(mut self) -> NodeSchema {
        self.mandatory = true;
        self
    }

    pub fn with_default(mut self, value: &str) -> NodeSchema {
        self.default = Some(value.to_string());
        self
    }

    pub fn with_leafref(mut self, target: &str) -> NodeSchema {
        self.leafref = Some(target.to_string());
        self
    }

    pub fn with_keys(mut self, keys: &[&str]) -> NodeSchema {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn user_ordered(mut self) -> NodeSchema {
        self.user_ordered = true;
        self
    }

    fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    fn depth(&self) -> usize {
        self.path.matches('/').count()
    }

    pub fn data_kind(&self) -> NodeKind {
        match self.kind {
            SchemaNodeKind::Container | SchemaNodeKind::PresenceContainer => NodeKind::Container,
            SchemaNodeKind::List => NodeKind::List,
            SchemaNodeKind::Leaf => NodeKind::Leaf,
            SchemaNodeKind::LeafList => NodeKind::LeafList,
            // Operation nodes are modeled as containers in data.
            SchemaNodeKind::Rpc | SchemaNodeKind::Notification => NodeKind::Container,
        }
    }
}

/// The schema of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSchema {
    pub name: String,
    pub revision: Option<String>,
    pub features: Vec<String>,
    pub nodes: Vec<NodeSchema>,
}

impl ModuleSchema {
    pub fn new(name: &str, revision: Option<&str>) -> ModuleSchema {
        ModuleSchema {
            name: name.to_string(),
            revision: revision.map(|r| r.to_string()),
            features: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: NodeSchema) -> ModuleSchema {
        self.nodes.push(node);
        self
    }

    pub fn node(&self, path: &str) -> Option<&NodeSchema> {
        self.nodes.iter().find(|n| n.path == path)
    }

    /// Direct schema children of `path` (`""` for top level).
    pub fn children_of<'a>(&'a self, path: &str) -> Vec<&'a NodeSchema> {
        let want_depth = path.matches('/').count() + 1;
        self.nodes
            .iter()
            .filter(|n| n.depth() == want_depth && n.path.starts_with(path) && {
                let rest = &n.path[path.len()..];
                rest.starts_with('/') && !rest[1..].contains('/')
            })
            .collect()
    }
}

/// Kind of an inter-module data dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepTag {
    /// leafref / when / must reference, resolvable statically.
    Ref,
    /// instance-identifier, resolved only against actual data.
    Instid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepDef {
    pub tag: DepTag,
    /// Name of the referenced module.
    pub target: String,
    /// Location of the dependency within the depending module.
    pub xpath: String,
}

/// Everything install needs to know about a module.
#[derive(Debug, Clone)]
pub struct ModuleDef {
    pub schema: ModuleSchema,
    pub replay_support: bool,
    pub data_deps: Vec<DepDef>,
    pub op_deps: Vec<DepDef>,
    /// Raw YANG text saved to the module shelf; optional for tests.
    pub yang_text: Option<String>,
}

impl ModuleDef {
    pub fn new(schema: ModuleSchema) -> ModuleDef {
        ModuleDef {
            schema,
            replay_support: false,
            data_deps: Vec::new(),
            op_deps: Vec::new(),
            yang_text: None,
        }
    }

    pub fn with_data_dep(mut self, tag: DepTag, target: &str, xpath: &str) -> ModuleDef {
        self.data_deps.push(DepDef {
            tag,
            target: target.to_string(),
            xpath: xpath.to_string(),
        });
        self
    }

    pub fn with_replay(mut self) -> ModuleDef {
        self.replay_support = true;
        self
    }
}

/// Process-local registry of module schemas, owned by a connection.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    modules: HashMap<String, ModuleSchema>,
}

impl SchemaRegistry {
    pub fn new() -> SchemaRegistry {
        SchemaRegistry {
            modules: HashMap::new(),
        }
    }

    pub fn add(&mut self, schema: ModuleSchema) {
        self.modules.insert(schema.name.clone(), schema);
    }

    pub fn remove(&mut self, name: &str) -> Option<ModuleSchema> {
        self.modules.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleSchema> {
        self.modules.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Validate one module's data: mandatory presence, list-key completeness,
/// and leafref resolution against the full module-info data set.
pub fn validate_module(schema: &ModuleSchema, data: &Tree, full_data: &Tree) -> StoreResult<()> {
    // Top-level mandatory nodes.
    for child in schema.children_of("") {
        if child.mandatory && child.config {
            let present = data
                .module_roots(&schema.name)
                .any(|n| n.name == child.name());
            if !present {
                return Err(StoreError::new(
                    ErrorKind::ValidationFailed,
                    format!("mandatory node '{}' is missing", child.name()),
                )
                .with_path(format!("/{}:{}", schema.name, child.name())));
            }
        }
    }

    for root in data.module_roots(&schema.name) {
        validate_node(schema, root, &format!("/{}", root.name), full_data, &format!("/{}:{}", schema.name, root.name))?;
    }
    Ok(())
}

fn validate_node(
    schema: &ModuleSchema,
    node: &Node,
    schema_path: &str,
    full_data: &Tree,
    data_path: &str,
) -> StoreResult<()> {
    if let Some(ns) = schema.node(schema_path) {
        // List instances must carry every declared key.
        if ns.kind == SchemaNodeKind::List {
            for key in &ns.keys {
                if !node.keys.iter().any(|(k, _)| k == key) {
                    return Err(StoreError::new(
                        ErrorKind::ValidationFailed,
                        format!("list instance is missing key '{}'", key),
                    )
                    .with_path(data_path.to_string()));
                }
            }
        }

        // Leafref targets must resolve to an instance with the same value.
        if let (Some(target), Some(value)) = (&ns.leafref, &node.value) {
            let target_path = XPath::parse(target)?;
            let hits = full_data.eval(&target_path);
            if !hits.iter().any(|t| t.value.as_deref() == Some(value.as_str())) {
                return Err(StoreError::new(
                    ErrorKind::ValidationFailed,
                    format!("leafref target '{}' has no instance with value '{}'", target, value),
                )
                .with_path(data_path.to_string()));
            }
        }

        // Mandatory children of a present container.
        if matches!(
            ns.kind,
            SchemaNodeKind::Container | SchemaNodeKind::PresenceContainer | SchemaNodeKind::List
        ) {
            for child in schema.children_of(schema_path) {
                if child.mandatory
                    && child.config
                    && !node.children.iter().any(|c| c.name == child.name())
                {
                    return Err(StoreError::new(
                        ErrorKind::ValidationFailed,
                        format!("mandatory node '{}' is missing", child.name()),
                    )
                    .with_path(format!("{}/{}", data_path, child.name())));
                }
            }
        }
    }

    for child in &node.children {
        let child_schema_path = format!("{}/{}", schema_path, child.name);
        let child_data_path = format!("{}/{}", data_path, child.path_segment());
        validate_node(schema, child, &child_schema_path, full_data, &child_data_path)?;
    }
    Ok(())
}

/// Materialize implicit defaults for one module. Returns the diff of created
/// nodes (operation `Create`, default flag set) so callers can fold it into
/// an accumulated diff. Idempotent: present leaves are never touched.
pub fn add_defaults(schema: &ModuleSchema, data: &mut Tree) -> Tree {
    let mut diff_roots = Vec::new();
    for root in data.roots.iter_mut() {
        if root.module != schema.name {
            continue;
        }
        let path = format!("/{}", root.name);
        let mut diff_kids = Vec::new();
        defaults_under(schema, &path, root, &mut diff_kids);
        if !diff_kids.is_empty() {
            let mut shell = root.clone_shallow();
            shell.children = diff_kids;
            diff_roots.push(shell);
        }
    }
    Tree { roots: diff_roots }
}

fn defaults_under(
    schema: &ModuleSchema,
    schema_path: &str,
    node: &mut Node,
    diff_out: &mut Vec<Node>,
) {
    for child_schema in schema.children_of(schema_path) {
        let name = child_schema.name().to_string();
        match child_schema.kind {
            SchemaNodeKind::Leaf => {
                if let Some(default) = child_schema.default.as_deref().filter(|_| child_schema.config) {
                    let present = node.children.iter().any(|c| c.name == name);
                    if !present {
                        let mut leaf = Node::leaf(&node.module, &name, default);
                        leaf.dflt = true;
                        let mut diff_leaf = leaf.clone();
                        diff_leaf.diff_op = crate::tree::DiffOp::Create;
                        diff_out.push(diff_leaf);
                        node.children.push(leaf);
                    }
                }
            }
            SchemaNodeKind::Container => {
                let child_path = format!("{}/{}", schema_path, name);
                match node.children.iter_mut().find(|c| c.name == name) {
                    Some(existing) => {
                        let mut kid_diff = Vec::new();
                        defaults_under(schema, &child_path, existing, &mut kid_diff);
                        if !kid_diff.is_empty() {
                            let mut shell = existing.clone_shallow();
                            shell.children = kid_diff;
                            diff_out.push(shell);
                        }
                    }
                    None => {
                        // A non-presence container exists implicitly; create
                        // it only when defaults materialize inside.
                        let mut fresh = Node::container(&node.module, &name);
                        fresh.config = child_schema.config;
                        let mut kid_diff = Vec::new();
                        defaults_under(schema, &child_path, &mut fresh, &mut kid_diff);
                        if !fresh.children.is_empty() {
                            let mut shell = fresh.clone_shallow();
                            shell.children = kid_diff;
                            diff_out.push(shell);
                            node.children.push(fresh);
                        }
                    }
                }
            }
            SchemaNodeKind::List => {
                let child_path = format!("{}/{}", schema_path, name);
                for instance in node.children.iter_mut().filter(|c| c.name == name) {
                    let mut kid_diff = Vec::new();
                    defaults_under(schema, &child_path, instance, &mut kid_diff);
                    if !kid_diff.is_empty() {
                        let mut shell = instance.clone_shallow();
                        shell.children = kid_diff;
                        diff_out.push(shell);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Recreate missing non-presence containers of the given config class so
/// operational composition has the full skeleton to hang data on.
pub fn add_np_containers(schema: &ModuleSchema, data: &mut Tree, state_only: bool) {
    for root_schema in schema.children_of("") {
        if root_schema.kind != SchemaNodeKind::Container {
            continue;
        }
        if state_only && root_schema.config {
            continue;
        }
        let name = root_schema.name().to_string();
        if !data.module_roots(&schema.name).any(|n| n.name == name) {
            let mut fresh = Node::container(&schema.name, &name);
            fresh.config = root_schema.config;
            data.roots.push(fresh);
        }
    }
    let module = schema.name.clone();
    for root in data.roots.iter_mut().filter(|n| n.module == module) {
        let path = format!("/{}", root.name);
        np_containers_under(schema, &path, root, state_only);
    }
}

fn np_containers_under(schema: &ModuleSchema, schema_path: &str, node: &mut Node, state_only: bool) {
    for child_schema in schema.children_of(schema_path) {
        if child_schema.kind != SchemaNodeKind::Container {
            continue;
        }
        if state_only && child_schema.config {
            continue;
        }
        let name = child_schema.name().to_string();
        if !node.children.iter().any(|c| c.name == name) {
            let mut fresh = Node::container(&node.module, &name);
            fresh.config = child_schema.config;
            node.children.push(fresh);
        }
    }
    for child in &mut node.children {
        let child_path = format!("{}/{}", schema_path, child.name);
        np_containers_under(schema, &child_path, child, state_only);
    }
}

/// Write a module's YANG text to the shelf with `@<revision>` appended when
/// set. Files are world-readable (0644).
pub fn save_yang_file(
    yang_dir: &Path,
    name: &str,
    revision: Option<&str>,
    text: &str,
) -> StoreResult<PathBuf> {
    std::fs::create_dir_all(yang_dir)
        .map_err(|e| StoreError::sys(format!("failed to create {:?}", yang_dir), e))?;
    let filename = match revision {
        Some(rev) => format!("{}@{}.yang", name, rev),
        None => format!("{}.yang", name),
    };
    let path = yang_dir.join(filename);
    std::fs::write(&path, text)
        .map_err(|e| StoreError::sys(format!("failed to write {:?}", path), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .map_err(|e| StoreError::sys(format!("failed to chmod {:?}", path), e))?;
    }
    Ok(path)
}
