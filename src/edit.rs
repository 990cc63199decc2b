/// Edit & Diff Engine
///
/// Applies caller edits to the module-partitioned data of a module-info set,
/// producing per-module diffs, and hosts the related contracts: diff
/// merging, wholesale replace with induced diff, schema validation over the
/// working set, implicit defaults, and operation (RPC/notification)
/// validation against operational data.
///
/// Edit operations follow NETCONF semantics: `merge` creates or updates,
/// `create` fails on an existing instance, `delete` fails on a missing one,
/// `remove` is delete-if-present, `replace` swaps the subtree. An operation
/// unset on a node is inherited from its parent. Moves of user-ordered list
/// instances are applied depth-first within created subtrees.
use tracing::debug;

use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::modinfo::{DepKind, EditModIter, ModInfo};
use crate::schema;
use crate::store::Datastore;
use crate::tree::{
    DiffOp, EditOp, LastWins, MoveAnchor, Node, OriginAware, Tree,
};
use crate::xpath::XPath;
use crate::MONITORING_MODULE;

/// Apply `edit` to the loaded data, accumulating per-module diffs into the
/// set when `make_diff` is set and marking changed modules.
pub fn edit_apply(minfo: &mut ModInfo<'_>, edit: &Tree, make_diff: bool) -> StoreResult<()> {
    for root in &edit.roots {
        if root.module == MONITORING_MODULE {
            return Err(StoreError::new(
                ErrorKind::Unsupported,
                format!("the internal module '{}' cannot be edited", MONITORING_MODULE),
            ));
        }
    }

    let (diff, changed) = apply_edit_to_tree(&mut minfo.data, edit, make_diff)?;
    for module in changed {
        minfo.mark_changed(&module);
    }
    if make_diff && !diff.is_empty() {
        diff_merge(minfo, diff)?;
    }
    Ok(())
}

/// Tree-level edit application. Returns the induced diff (empty unless
/// `make_diff`) and the list of modules that own at least one actual change.
pub fn apply_edit_to_tree(
    data: &mut Tree,
    edit: &Tree,
    make_diff: bool,
) -> StoreResult<(Tree, Vec<String>)> {
    let mut diff = Tree::new();
    let mut changed = Vec::new();

    for (module, _) in EditModIter::new(edit) {
        let mut diff_nodes = Vec::new();
        for root in edit.roots.iter().filter(|r| r.module == module) {
            apply_edit_node(&mut data.roots, root, EditOp::Merge, &mut diff_nodes)?;
        }
        if !diff_nodes.is_empty() {
            changed.push(module);
            if make_diff {
                Tree::diff_merge(&mut diff, Tree { roots: diff_nodes }, &LastWins);
            }
        }
    }
    Ok((diff, changed))
}

fn apply_edit_node(
    data: &mut Vec<Node>,
    enode: &Node,
    inherited: EditOp,
    diff_out: &mut Vec<Node>,
) -> StoreResult<()> {
    let op = enode.edit_op.unwrap_or(inherited);
    let existing = data.iter().position(|c| c.same_identity(enode));

    match op {
        EditOp::Create => match existing {
            Some(_) => Err(StoreError::new(ErrorKind::Exists, "node already exists")
                .with_path(format!("/{}", enode.path_segment()))),
            None => {
                insert_node(data, enode.clone().into_data(), enode.insert.as_ref())?;
                diff_out.push(mark_diff(enode.clone().into_data(), DiffOp::Create));
                Ok(())
            }
        },
        EditOp::Replace => match existing {
            None => {
                insert_node(data, enode.clone().into_data(), enode.insert.as_ref())?;
                diff_out.push(mark_diff(enode.clone().into_data(), DiffOp::Create));
                Ok(())
            }
            Some(i) => {
                let old = Tree::with_root(data[i].clone());
                let new = Tree::with_root(enode.clone().into_data());
                let sub_diff = Tree::diff(&old, &new);
                data[i] = enode.clone().into_data();
                diff_out.extend(sub_diff.roots);
                Ok(())
            }
        },
        EditOp::Merge => match existing {
            None => {
                insert_node(data, enode.clone().into_data(), enode.insert.as_ref())?;
                diff_out.push(mark_diff(enode.clone().into_data(), DiffOp::Create));
                Ok(())
            }
            Some(i) => {
                let mut kid_diff = Vec::new();
                let value_changed =
                    enode.value.is_some() && data[i].value != enode.value;
                if value_changed {
                    let mut d = enode.clone_shallow().into_data();
                    d.diff_op = DiffOp::Replace;
                    d.prev_value = data[i].value.clone();
                    kid_diff.push(d);
                    data[i].value = enode.value.clone();
                    data[i].dflt = enode.dflt;
                }
                for child in &enode.children {
                    apply_edit_node(&mut data[i].children, child, EditOp::Merge, &mut kid_diff)?;
                }
                let moved = apply_move(data, i, enode)?;

                if value_changed {
                    // The replace entry is already complete; wrap only the
                    // child changes in a parent shell.
                    let replace = kid_diff.remove(0);
                    diff_out.push(replace);
                }
                if !kid_diff.is_empty() || moved {
                    let mut shell = enode.clone_shallow().into_data();
                    shell.diff_op = if moved { DiffOp::Move } else { DiffOp::None };
                    shell.children = kid_diff;
                    diff_out.push(shell);
                }
                Ok(())
            }
        },
        EditOp::Delete => match existing {
            None => Err(StoreError::new(ErrorKind::NotFound, "node to delete does not exist")
                .with_path(format!("/{}", enode.path_segment()))),
            Some(i) => {
                let removed = data.remove(i);
                diff_out.push(mark_diff(removed, DiffOp::Delete));
                Ok(())
            }
        },
        EditOp::Remove => {
            if let Some(i) = existing {
                let removed = data.remove(i);
                diff_out.push(mark_diff(removed, DiffOp::Delete));
            }
            Ok(())
        }
    }
}

/// Insert a new node, honoring a user-ordered anchor when present.
fn insert_node(data: &mut Vec<Node>, node: Node, anchor: Option<&MoveAnchor>) -> StoreResult<()> {
    let pos = match anchor {
        None | Some(MoveAnchor::Last) => sibling_range(data, &node).1,
        Some(MoveAnchor::First) => sibling_range(data, &node).0,
        Some(MoveAnchor::Before(keys)) => sibling_with_keys(data, &node, keys)?,
        Some(MoveAnchor::After(keys)) => sibling_with_keys(data, &node, keys)? + 1,
    };
    data.insert(pos, node);
    Ok(())
}

/// Reposition an existing user-ordered instance. Returns whether it moved.
fn apply_move(data: &mut Vec<Node>, idx: usize, enode: &Node) -> StoreResult<bool> {
    let anchor = match &enode.insert {
        Some(a) => a.clone(),
        None => return Ok(false),
    };
    let node = data.remove(idx);
    let pos = match &anchor {
        MoveAnchor::First => sibling_range(data, &node).0,
        MoveAnchor::Last => sibling_range(data, &node).1,
        MoveAnchor::Before(keys) => sibling_with_keys(data, &node, keys)?,
        MoveAnchor::After(keys) => sibling_with_keys(data, &node, keys)? + 1,
    };
    let moved = pos != idx;
    data.insert(pos, node);
    Ok(moved)
}

/// First and one-past-last positions of the sibling run sharing this node's
/// module and name.
fn sibling_range(data: &[Node], node: &Node) -> (usize, usize) {
    let mut first = data.len();
    let mut last = data.len();
    for (i, n) in data.iter().enumerate() {
        if n.module == node.module && n.name == node.name {
            if first == data.len() {
                first = i;
            }
            last = i + 1;
        }
    }
    if first == data.len() {
        (data.len(), data.len())
    } else {
        (first, last)
    }
}

fn sibling_with_keys(data: &[Node], node: &Node, keys: &[(String, String)]) -> StoreResult<usize> {
    data.iter()
        .position(|n| n.module == node.module && n.name == node.name && n.keys == *keys)
        .ok_or_else(|| {
            StoreError::new(
                ErrorKind::NotFound,
                "move anchor instance does not exist",
            )
            .with_path(format!("/{}", node.path_segment()))
        })
}

fn mark_diff(mut node: Node, op: DiffOp) -> Node {
    node.diff_op = op;
    node.children = node
        .children
        .into_iter()
        .map(|c| mark_diff(c, op))
        .collect();
    node
}

/// Merge `new_diff` into the set's accumulated diff. Operational sets use
/// the origin-aware policy so unowned nodes keep their owner.
pub fn diff_merge(minfo: &mut ModInfo<'_>, new_diff: Tree) -> StoreResult<()> {
    if minfo.ds == Datastore::Operational {
        Tree::diff_merge(&mut minfo.diff, new_diff, &OriginAware);
    } else {
        Tree::diff_merge(&mut minfo.diff, new_diff, &LastWins);
    }
    Ok(())
}

/// Replace each requested module's subtree with the one from `src`,
/// computing the induced diff. Modules whose diff comes out empty keep
/// their current tree.
pub fn replace(minfo: &mut ModInfo<'_>, mut src: Tree) -> StoreResult<()> {
    let req: Vec<String> = minfo
        .entries
        .iter()
        .filter(|e| e.kind == DepKind::Req)
        .map(|e| e.name.clone())
        .collect();

    for module in req {
        let dst_part = minfo.data.take_module(&module);
        let src_part = src.take_module(&module);
        let diff = Tree::diff(&dst_part, &src_part);
        if diff.is_empty() {
            minfo.data.attach(dst_part);
        } else {
            minfo.data.attach(src_part);
            minfo.mark_changed(&module);
            diff_merge(minfo, diff)?;
        }
    }
    Ok(())
}

/// Validate every entry whose kind is in `kinds` (or which changed) against
/// its schema, with the whole working-set forest as leafref context.
pub fn validate(minfo: &ModInfo<'_>, kinds: &[DepKind]) -> StoreResult<()> {
    let schemas = minfo.conn.schemas.read();
    for entry in &minfo.entries {
        if !kinds.contains(&entry.kind) && !entry.changed {
            continue;
        }
        let Some(schema) = schemas.get(&entry.name) else {
            continue;
        };
        let module_data = minfo.data.module_data(&entry.name);
        schema::validate_module(schema, &module_data, &minfo.data)?;
        debug!(target: "yangstore::edit", "validated module '{}'", entry.name);
    }
    Ok(())
}

/// Materialize implicit defaults for every requested module (conventional
/// datastores only). With `finish_diff`, created defaults are folded into
/// the accumulated diff and the module is marked changed.
pub fn add_defaults(minfo: &mut ModInfo<'_>, finish_diff: bool) -> StoreResult<()> {
    if !minfo.ds.is_conventional() {
        return Ok(());
    }
    let req: Vec<String> = minfo
        .entries
        .iter()
        .filter(|e| e.kind == DepKind::Req)
        .map(|e| e.name.clone())
        .collect();

    for module in req {
        let diff = {
            let schemas = minfo.conn.schemas.read();
            let Some(schema) = schemas.get(&module) else {
                continue;
            };
            schema::add_defaults(schema, &mut minfo.data)
        };
        if finish_diff && !diff.is_empty() {
            minfo.mark_changed(&module);
            diff_merge(minfo, diff)?;
        }
    }
    Ok(())
}

/// Validate an RPC/action/notification tree: the data parent of a nested
/// operation must exist in the operational datastore.
pub fn op_validate(oper_data: &Tree, op: &Tree) -> StoreResult<()> {
    let root = op.roots.first().ok_or_else(|| {
        StoreError::new(ErrorKind::InvalArg, "operation tree is empty")
    })?;

    // Walk the single chain down to the operation node, collecting the
    // parent path.
    let mut segments = Vec::new();
    let mut node = root;
    while node.children.len() == 1 && !node.children[0].children.is_empty() {
        segments.push(node.path_segment());
        node = &node.children[0];
    }

    if segments.is_empty() {
        // Top-level operation, nothing to anchor.
        return Ok(());
    }

    let parent_path = format!("/{}", segments.join("/"));
    let path = XPath::parse(&parent_path)?;
    if oper_data.eval(&path).is_empty() {
        return Err(StoreError::new(
            ErrorKind::ValidationFailed,
            "data parent of the nested operation does not exist",
        )
        .with_path(parent_path));
    }
    Ok(())
}
