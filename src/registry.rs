/// Module Registry
///
/// Lookup and lifecycle of module descriptors in the Main SHM: install,
/// uninstall, feature toggling, dependency arrays, and the Ext SHM
/// defragmentation pass that compacts the heap by walking the offset graph
/// from its Main SHM roots.
///
/// All mutating entry points expect the caller to hold the schema lock plus
/// the SHM lock in WRITE mode.
use tracing::{debug, info};

use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::schema::{DepDef, DepTag, ModuleDef};
use crate::shm::{
    align_up, mod_desc_off, ChangeSubShm, ConnEntryShm, DepEntryShm, ExtShm, ModDescriptor,
    NotifSubShm, OperSubShm, RpcSubShm, ShmCtx, DEP_TAG_INSTID, DEP_TAG_REF, EXT_HEADER_SIZE,
    LOCK_STATE_SIZE, MOD_DESC_OFF_DATA_LOCKS, MOD_FLAG_REPLAY,
};

/// A resolved dependency entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dep {
    pub tag: DepTag,
    pub target: String,
    pub xpath: String,
}

/// Offset of a module's per-datastore data lock within the Main SHM.
pub fn data_lock_off(idx: u32, ds_index: usize) -> usize {
    mod_desc_off(idx) + MOD_DESC_OFF_DATA_LOCKS + ds_index * LOCK_STATE_SIZE
}

/// Find a module descriptor by name. O(n) over the descriptor array, which
/// stays small (hundreds of modules).
pub fn find_module(shm: &ShmCtx, name: &str) -> StoreResult<Option<(u32, ModDescriptor)>> {
    let count = shm.main.mod_count()?;
    for idx in 0..count {
        let desc = shm.main.read_descriptor(idx)?;
        if shm.ext.read_str(desc.name_off)? == name {
            return Ok(Some((idx, desc)));
        }
    }
    Ok(None)
}

pub fn module_name(shm: &ShmCtx, desc: &ModDescriptor) -> StoreResult<String> {
    shm.ext.read_str(desc.name_off)
}

/// All installed module names, in descriptor order.
pub fn module_names(shm: &ShmCtx) -> StoreResult<Vec<String>> {
    let count = shm.main.mod_count()?;
    let mut out = Vec::with_capacity(count as usize);
    for idx in 0..count {
        let desc = shm.main.read_descriptor(idx)?;
        out.push(shm.ext.read_str(desc.name_off)?);
    }
    Ok(out)
}

fn dep_to_shm(shm: &ShmCtx, dep: &DepDef) -> StoreResult<DepEntryShm> {
    Ok(DepEntryShm {
        target_off: shm.ext.store_str(&dep.target)?,
        xpath_off: shm.ext.store_str(&dep.xpath)?,
        tag: match dep.tag {
            DepTag::Ref => DEP_TAG_REF,
            DepTag::Instid => DEP_TAG_INSTID,
        },
        _pad: 0,
    })
}

fn dep_from_shm(shm: &ShmCtx, entry: &DepEntryShm) -> StoreResult<Dep> {
    Ok(Dep {
        tag: if entry.tag == DEP_TAG_INSTID {
            DepTag::Instid
        } else {
            DepTag::Ref
        },
        target: shm.ext.read_str(entry.target_off)?,
        xpath: shm.ext.read_str(entry.xpath_off)?,
    })
}

/// Read a module's data dependencies.
pub fn data_deps(shm: &ShmCtx, desc: &ModDescriptor) -> StoreResult<Vec<Dep>> {
    let entries: Vec<DepEntryShm> = shm.ext.array_get(desc.data_deps_off, desc.data_dep_count)?;
    entries.iter().map(|e| dep_from_shm(shm, e)).collect()
}

/// Read a module's inverse data dependencies (modules that reference it).
pub fn inv_deps(shm: &ShmCtx, desc: &ModDescriptor) -> StoreResult<Vec<Dep>> {
    let entries: Vec<DepEntryShm> = shm.ext.array_get(desc.inv_deps_off, desc.inv_dep_count)?;
    entries.iter().map(|e| dep_from_shm(shm, e)).collect()
}

/// Read a module's operational dependencies.
pub fn op_deps(shm: &ShmCtx, desc: &ModDescriptor) -> StoreResult<Vec<Dep>> {
    let entries: Vec<DepEntryShm> = shm.ext.array_get(desc.op_deps_off, desc.op_dep_count)?;
    entries.iter().map(|e| dep_from_shm(shm, e)).collect()
}

/// Enabled features of a module.
pub fn features(shm: &ShmCtx, desc: &ModDescriptor) -> StoreResult<Vec<String>> {
    let offs: Vec<u64> = shm.ext.array_get(desc.features_off, desc.feature_count)?;
    offs.iter().map(|&off| shm.ext.read_str(off)).collect()
}

/// Install a module: create its descriptor, store its strings and dependency
/// arrays, and register the inverse entries on every dependency target.
pub fn install_module(shm: &ShmCtx, def: &ModuleDef) -> StoreResult<u32> {
    if find_module(shm, &def.schema.name)?.is_some() {
        return Err(StoreError::new(
            ErrorKind::Exists,
            format!("module '{}' is already installed", def.schema.name),
        ));
    }

    let mut desc = bytemuck::Zeroable::zeroed();
    fill_descriptor(shm, &mut desc, def)?;

    let idx = shm.main.mod_count()?;
    shm.main.grow_for_descriptor(idx + 1)?;
    shm.main.write_descriptor(idx, &desc)?;
    shm.main.set_mod_count(idx + 1)?;

    // Inverse entries: every REF target learns who references it.
    for dep in &def.data_deps {
        if dep.target == def.schema.name {
            continue;
        }
        if let Some((tidx, tdesc)) = find_module(shm, &dep.target)? {
            let inv = DepEntryShm {
                target_off: desc.name_off,
                xpath_off: shm.ext.store_str(&dep.xpath)?,
                tag: match dep.tag {
                    DepTag::Ref => DEP_TAG_REF,
                    DepTag::Instid => DEP_TAG_INSTID,
                },
                _pad: 0,
            };
            let new_off = shm.ext.array_add(tdesc.inv_deps_off, tdesc.inv_dep_count, &inv)?;
            shm.main.update_descriptor(tidx, |d| {
                d.inv_deps_off = new_off;
                d.inv_dep_count += 1;
            })?;
        }
    }

    info!(target: "yangstore::registry", "installed module '{}' (idx {})", def.schema.name, idx);
    Ok(idx)
}

fn fill_descriptor(shm: &ShmCtx, desc: &mut ModDescriptor, def: &ModuleDef) -> StoreResult<()> {
    desc.name_off = shm.ext.store_str(&def.schema.name)?;
    desc.rev_off = shm.ext.store_opt_str(def.schema.revision.as_deref())?;
    if def.replay_support {
        desc.flags |= MOD_FLAG_REPLAY;
    }

    for feature in &def.schema.features {
        let foff = shm.ext.store_str(feature)?;
        desc.features_off = shm
            .ext
            .array_add(desc.features_off, desc.feature_count, &foff)?;
        desc.feature_count += 1;
    }
    for dep in &def.data_deps {
        let entry = dep_to_shm(shm, dep)?;
        desc.data_deps_off = shm
            .ext
            .array_add(desc.data_deps_off, desc.data_dep_count, &entry)?;
        desc.data_dep_count += 1;
    }
    for dep in &def.op_deps {
        let entry = dep_to_shm(shm, dep)?;
        desc.op_deps_off = shm.ext.array_add(desc.op_deps_off, desc.op_dep_count, &entry)?;
        desc.op_dep_count += 1;
    }
    Ok(())
}

/// Uninstall a module: drop its descriptor (compacting the array), its Ext
/// SHM blocks, and the inverse entries it planted on other modules.
pub fn uninstall_module(shm: &ShmCtx, name: &str) -> StoreResult<()> {
    let (idx, desc) = find_module(shm, name)?.ok_or_else(|| {
        StoreError::new(ErrorKind::NotFound, format!("module '{}' is not installed", name))
    })?;

    // Surrender this module's blocks to the wasted counter.
    waste_descriptor(shm, &desc)?;

    // Remove inverse entries pointing at the departing module.
    let count = shm.main.mod_count()?;
    for other in 0..count {
        if other == idx {
            continue;
        }
        let odesc = shm.main.read_descriptor(other)?;
        let mut entries: Vec<DepEntryShm> =
            shm.ext.array_get(odesc.inv_deps_off, odesc.inv_dep_count)?;
        let mut off = odesc.inv_deps_off;
        let mut n = odesc.inv_dep_count;
        let mut i = 0;
        while i < entries.len() {
            if shm.ext.read_str(entries[i].target_off)? == name {
                off = shm.ext.array_del::<DepEntryShm>(off, n, i as u32)?;
                n -= 1;
                entries.remove(i);
            } else {
                i += 1;
            }
        }
        if n != odesc.inv_dep_count {
            shm.main.update_descriptor(other, |d| {
                d.inv_deps_off = off;
                d.inv_dep_count = n;
            })?;
        }
    }

    // Compact the descriptor array.
    for i in idx..count - 1 {
        let next = shm.main.read_descriptor(i + 1)?;
        shm.main.write_descriptor(i, &next)?;
    }
    shm.main.set_mod_count(count - 1)?;

    info!(target: "yangstore::registry", "uninstalled module '{}'", name);
    Ok(())
}

fn waste_descriptor(shm: &ShmCtx, desc: &ModDescriptor) -> StoreResult<()> {
    let mut wasted = 0u32;
    let name = shm.ext.read_str(desc.name_off)?;
    wasted += ExtShm::str_block_size(&name);
    if desc.rev_off != 0 {
        wasted += ExtShm::str_block_size(&shm.ext.read_str(desc.rev_off)?);
    }
    for dep_set in [
        (desc.data_deps_off, desc.data_dep_count),
        (desc.inv_deps_off, desc.inv_dep_count),
        (desc.op_deps_off, desc.op_dep_count),
    ] {
        let entries: Vec<DepEntryShm> = shm.ext.array_get(dep_set.0, dep_set.1)?;
        for e in &entries {
            wasted += ExtShm::str_block_size(&shm.ext.read_str(e.target_off)?);
            wasted += ExtShm::str_block_size(&shm.ext.read_str(e.xpath_off)?);
        }
        if dep_set.1 > 0 {
            wasted += align_up(dep_set.1 as usize * std::mem::size_of::<DepEntryShm>()) as u32;
        }
    }
    let foffs: Vec<u64> = shm.ext.array_get(desc.features_off, desc.feature_count)?;
    for &foff in &foffs {
        wasted += ExtShm::str_block_size(&shm.ext.read_str(foff)?);
    }
    if desc.feature_count > 0 {
        wasted += align_up(desc.feature_count as usize * 8) as u32;
    }
    shm.ext.wasted_add(wasted)
}

/// Enable or disable a feature on an installed module.
pub fn set_feature(shm: &ShmCtx, name: &str, feature: &str, enable: bool) -> StoreResult<()> {
    let (idx, desc) = find_module(shm, name)?.ok_or_else(|| {
        StoreError::new(ErrorKind::NotFound, format!("module '{}' is not installed", name))
    })?;

    let offs: Vec<u64> = shm.ext.array_get(desc.features_off, desc.feature_count)?;
    let mut existing = None;
    for (i, &off) in offs.iter().enumerate() {
        if shm.ext.read_str(off)? == feature {
            existing = Some(i as u32);
            break;
        }
    }

    match (enable, existing) {
        (true, Some(_)) => Err(StoreError::new(
            ErrorKind::Exists,
            format!("feature '{}' is already enabled on '{}'", feature, name),
        )),
        (false, None) => Err(StoreError::new(
            ErrorKind::NotFound,
            format!("feature '{}' is not enabled on '{}'", feature, name),
        )),
        (true, None) => {
            let foff = shm.ext.store_str(feature)?;
            let new_off = shm.ext.array_add(desc.features_off, desc.feature_count, &foff)?;
            shm.main.update_descriptor(idx, |d| {
                d.features_off = new_off;
                d.feature_count += 1;
            })
        }
        (false, Some(i)) => {
            shm.ext
                .wasted_add(ExtShm::str_block_size(feature))?;
            let new_off = shm.ext.array_del::<u64>(desc.features_off, desc.feature_count, i)?;
            shm.main.update_descriptor(idx, |d| {
                d.features_off = new_off;
                d.feature_count -= 1;
            })
        }
    }
}

/// Compact the Ext SHM by rebuilding it from the Main SHM roots: module
/// descriptor strings/arrays, subscription tables, the RPC table, and the
/// connection list. Every live block is copied into a fresh image and the
/// referencing offsets are rewritten.
pub fn defrag(shm: &ShmCtx) -> StoreResult<()> {
    let mut image: Vec<u8> = vec![0u8; EXT_HEADER_SIZE];

    let put_bytes = |image: &mut Vec<u8>, bytes: &[u8]| -> u64 {
        let off = align_up(image.len());
        image.resize(off, 0);
        image.extend_from_slice(bytes);
        let aligned_end = align_up(image.len());
        image.resize(aligned_end, 0);
        off as u64
    };
    let put_str = |image: &mut Vec<u8>, s: &str| -> u64 {
        let mut block = Vec::with_capacity(4 + s.len());
        block.extend_from_slice(&(s.len() as u32).to_le_bytes());
        block.extend_from_slice(s.as_bytes());
        let off = align_up(image.len());
        image.resize(off, 0);
        image.extend_from_slice(&block);
        let aligned_end = align_up(image.len());
        image.resize(aligned_end, 0);
        off as u64
    };

    let move_str = |shm: &ShmCtx, image: &mut Vec<u8>, off: u64| -> StoreResult<u64> {
        if off == 0 {
            return Ok(0);
        }
        Ok(put_str(image, &shm.ext.read_str(off)?))
    };

    let count = shm.main.mod_count()?;
    for idx in 0..count {
        let mut desc = shm.main.read_descriptor(idx)?;

        desc.name_off = move_str(shm, &mut image, desc.name_off)?;
        desc.rev_off = move_str(shm, &mut image, desc.rev_off)?;

        let mut foffs: Vec<u64> = shm.ext.array_get(desc.features_off, desc.feature_count)?;
        for foff in foffs.iter_mut() {
            *foff = move_str(shm, &mut image, *foff)?;
        }
        desc.features_off = if foffs.is_empty() {
            0
        } else {
            put_bytes(&mut image, bytemuck::cast_slice(&foffs))
        };

        for (arr_off, arr_count) in [
            (&mut desc.data_deps_off, desc.data_dep_count),
            (&mut desc.inv_deps_off, desc.inv_dep_count),
            (&mut desc.op_deps_off, desc.op_dep_count),
        ] {
            let mut entries: Vec<DepEntryShm> = shm.ext.array_get(*arr_off, arr_count)?;
            for e in entries.iter_mut() {
                e.target_off = move_str(shm, &mut image, e.target_off)?;
                e.xpath_off = move_str(shm, &mut image, e.xpath_off)?;
            }
            *arr_off = if entries.is_empty() {
                0
            } else {
                put_bytes(&mut image, bytemuck::cast_slice(&entries))
            };
        }

        for ds in 0..4 {
            let mut subs: Vec<ChangeSubShm> =
                shm.ext.array_get(desc.change_subs_off[ds], desc.change_sub_count[ds])?;
            for s in subs.iter_mut() {
                s.xpath_off = move_str(shm, &mut image, s.xpath_off)?;
            }
            desc.change_subs_off[ds] = if subs.is_empty() {
                0
            } else {
                put_bytes(&mut image, bytemuck::cast_slice(&subs))
            };
        }

        let mut oper: Vec<OperSubShm> =
            shm.ext.array_get(desc.oper_subs_off, desc.oper_sub_count)?;
        for s in oper.iter_mut() {
            s.xpath_off = move_str(shm, &mut image, s.xpath_off)?;
        }
        desc.oper_subs_off = if oper.is_empty() {
            0
        } else {
            put_bytes(&mut image, bytemuck::cast_slice(&oper))
        };

        let mut notif: Vec<NotifSubShm> =
            shm.ext.array_get(desc.notif_subs_off, desc.notif_sub_count)?;
        for s in notif.iter_mut() {
            s.xpath_off = move_str(shm, &mut image, s.xpath_off)?;
        }
        desc.notif_subs_off = if notif.is_empty() {
            0
        } else {
            put_bytes(&mut image, bytemuck::cast_slice(&notif))
        };

        shm.main.write_descriptor(idx, &desc)?;
    }

    let header = shm.main.read_header()?;
    let mut rpc: Vec<RpcSubShm> = shm.ext.array_get(header.rpc_subs_off, header.rpc_sub_count)?;
    for s in rpc.iter_mut() {
        s.path_off = move_str(shm, &mut image, s.path_off)?;
    }
    let rpc_off = if rpc.is_empty() {
        0
    } else {
        put_bytes(&mut image, bytemuck::cast_slice(&rpc))
    };
    let conns: Vec<ConnEntryShm> = shm.ext.array_get(header.conn_list_off, header.conn_count)?;
    let conn_off = if conns.is_empty() {
        0
    } else {
        put_bytes(&mut image, bytemuck::cast_slice(&conns))
    };
    shm.main.update_header(|h| {
        h.rpc_subs_off = rpc_off;
        h.conn_list_off = conn_off;
    })?;

    let new_size = image.len();
    shm.ext.replace_with(&image)?;
    debug!(target: "yangstore::registry", "defragmented Ext SHM down to {} bytes", new_size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ModuleSchema, NodeSchema, SchemaNodeKind};
    use tempfile::TempDir;

    fn open_ctx(temp: &TempDir) -> ShmCtx {
        let (ctx, _) = ShmCtx::open(
            &temp.path().join("r_main"),
            &temp.path().join("r_ext"),
            &temp.path().join("r_create.lock"),
        )
        .unwrap();
        ctx
    }

    fn simple_def(name: &str) -> ModuleDef {
        ModuleDef::new(
            ModuleSchema::new(name, Some("2020-01-01"))
                .with_node(NodeSchema::new("/root", SchemaNodeKind::Container)),
        )
    }

    #[test]
    fn test_install_find_uninstall() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);

        let idx = install_module(&ctx, &simple_def("m1")).unwrap();
        assert_eq!(idx, 0);
        install_module(&ctx, &simple_def("m2")).unwrap();

        let (found, desc) = find_module(&ctx, "m2").unwrap().unwrap();
        assert_eq!(found, 1);
        assert_eq!(module_name(&ctx, &desc).unwrap(), "m2");
        assert_eq!(ctx.ext.read_str(desc.rev_off).unwrap(), "2020-01-01");

        // Duplicate install fails.
        let err = install_module(&ctx, &simple_def("m1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exists);

        uninstall_module(&ctx, "m1").unwrap();
        assert!(find_module(&ctx, "m1").unwrap().is_none());
        // m2 shifted down to index 0.
        let (found, _) = find_module(&ctx, "m2").unwrap().unwrap();
        assert_eq!(found, 0);
        assert!(ctx.ext.wasted().unwrap() > 0);
    }

    #[test]
    fn test_install_wires_inverse_deps() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);

        install_module(&ctx, &simple_def("ops-ref")).unwrap();
        let def = simple_def("ops").with_data_dep(DepTag::Ref, "ops-ref", "/ops:root/ref");
        install_module(&ctx, &def).unwrap();

        let (_, ops_desc) = find_module(&ctx, "ops").unwrap().unwrap();
        let deps = data_deps(&ctx, &ops_desc).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].target, "ops-ref");
        assert_eq!(deps[0].tag, DepTag::Ref);

        let (_, ref_desc) = find_module(&ctx, "ops-ref").unwrap().unwrap();
        let inv = inv_deps(&ctx, &ref_desc).unwrap();
        assert_eq!(inv.len(), 1);
        assert_eq!(inv[0].target, "ops");

        // Uninstalling the depending module cleans up the inverse entry.
        uninstall_module(&ctx, "ops").unwrap();
        let (_, ref_desc) = find_module(&ctx, "ops-ref").unwrap().unwrap();
        assert!(inv_deps(&ctx, &ref_desc).unwrap().is_empty());
    }

    #[test]
    fn test_set_feature() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);
        install_module(&ctx, &simple_def("m1")).unwrap();

        set_feature(&ctx, "m1", "fast-path", true).unwrap();
        let (_, desc) = find_module(&ctx, "m1").unwrap().unwrap();
        assert_eq!(features(&ctx, &desc).unwrap(), vec!["fast-path"]);

        let err = set_feature(&ctx, "m1", "fast-path", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exists);

        set_feature(&ctx, "m1", "fast-path", false).unwrap();
        let (_, desc) = find_module(&ctx, "m1").unwrap().unwrap();
        assert!(features(&ctx, &desc).unwrap().is_empty());

        let err = set_feature(&ctx, "m1", "fast-path", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_defrag_preserves_content() {
        let temp = TempDir::new().unwrap();
        let ctx = open_ctx(&temp);

        install_module(&ctx, &simple_def("keep-a")).unwrap();
        let def = simple_def("keep-b").with_data_dep(DepTag::Ref, "keep-a", "/keep-b:root/x");
        install_module(&ctx, &def).unwrap();
        install_module(&ctx, &simple_def("drop-me")).unwrap();
        set_feature(&ctx, "keep-a", "f1", true).unwrap();
        uninstall_module(&ctx, "drop-me").unwrap();

        let before = ctx.ext.len();
        assert!(ctx.ext.wasted().unwrap() > 0);
        defrag(&ctx).unwrap();

        assert_eq!(ctx.ext.wasted().unwrap(), 0);
        assert!(ctx.ext.len() <= before);

        // Everything is still reachable and intact.
        let (_, a_desc) = find_module(&ctx, "keep-a").unwrap().unwrap();
        assert_eq!(features(&ctx, &a_desc).unwrap(), vec!["f1"]);
        let (_, b_desc) = find_module(&ctx, "keep-b").unwrap().unwrap();
        let deps = data_deps(&ctx, &b_desc).unwrap();
        assert_eq!(deps[0].target, "keep-a");
        assert_eq!(deps[0].xpath, "/keep-b:root/x");
        let inv = inv_deps(&ctx, &a_desc).unwrap();
        assert_eq!(inv[0].target, "keep-b");
    }
}
