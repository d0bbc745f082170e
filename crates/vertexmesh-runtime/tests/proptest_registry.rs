//! Registry operations checked against a plain map model.

use std::collections::HashMap;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;
use vertexmesh_runtime::{ConnectionRegistry, RegistryMap};
use vertexmesh_transport::ConnectionKey;

#[derive(Debug, Clone)]
enum Op {
    Register(u8),
    Replace(u8),
    RemoveOwn(u8, usize),
    Cancel(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3).prop_map(Op::Register),
        (0u8..3).prop_map(Op::Replace),
        (0u8..3, 0usize..16).prop_map(|(k, i)| Op::RemoveOwn(k, i)),
        (0u8..3).prop_map(Op::Cancel),
    ]
}

fn key(n: u8) -> ConnectionKey {
    ConnectionKey::new(format!("v{}", n), "out", "sink", "in")
}

proptest! {
    #[test]
    fn test_registry_matches_model(ops in proptest::collection::vec(op(), 1..40)) {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new(root.clone());
        let mut model: HashMap<u8, u64> = HashMap::new();
        let mut issued: Vec<(u8, u64, CancellationToken)> = Vec::new();

        for op in ops {
            match op {
                Op::Register(k) => {
                    let got = registry.try_register(RegistryMap::Outbound, &key(k));
                    prop_assert_eq!(got.is_some(), !model.contains_key(&k));
                    if let Some(reg) = got {
                        model.insert(k, reg.id);
                        issued.push((k, reg.id, reg.token));
                    }
                }
                Op::Replace(k) => {
                    let reg = registry.register_replacing(RegistryMap::Outbound, &key(k));
                    if let Some(old) = model.insert(k, reg.id) {
                        let (_, _, token) = issued.iter().find(|(_, id, _)| *id == old).unwrap();
                        prop_assert!(token.is_cancelled());
                    }
                    issued.push((k, reg.id, reg.token));
                }
                Op::RemoveOwn(k, i) => {
                    let Some((_, id, _)) = issued.iter().filter(|(ik, _, _)| *ik == k).nth(i) else {
                        continue;
                    };
                    let removed = registry.remove_own(RegistryMap::Outbound, &key(k), *id);
                    prop_assert_eq!(removed, model.get(&k) == Some(id));
                    if removed {
                        model.remove(&k);
                    }
                }
                Op::Cancel(k) => {
                    let cancelled = registry.cancel(RegistryMap::Outbound, &key(k));
                    prop_assert_eq!(cancelled, model.remove(&k).is_some());
                }
            }
            prop_assert_eq!(registry.len(RegistryMap::Outbound), model.len());
        }

        root.cancel();
        prop_assert!(issued.iter().all(|(_, _, token)| token.is_cancelled()));
    }
}
