// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Configuration defaults, environment overrides, and validation.

use std::collections::HashMap;

use mmcoll::config::{ENV_FIFO_SIZE, ENV_MT, ENV_SEG_SIZE, ENV_STRATEGY};
use mmcoll::{
    CollError, CollIface, CollIfaceConfig, IfaceKind, IfaceParams, ReduceOp, Reducer, Strategy,
};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |k| map.get(k).cloned()
}

#[test]
fn defaults() {
    let cfg = CollIfaceConfig::default();
    assert_eq!(cfg.fifo_size, 64);
    assert_eq!(cfg.fifo_elem_size, 128);
    assert_eq!(cfg.seg_size, 8192);
    assert_eq!(cfg.fifo_poll_count, 16);
    assert_eq!(cfg.centralized_threshold, 8);
    assert_eq!(cfg.strategy, None);
    assert!(!cfg.multi_thread);
    cfg.validate().unwrap();
}

#[test]
fn overrides_from_lookup() {
    let cfg = CollIfaceConfig::from_lookup(lookup(&[
        (ENV_FIFO_SIZE, "8"),
        (ENV_SEG_SIZE, "4096"),
        (ENV_STRATEGY, "centralized"),
        (ENV_MT, "y"),
    ]))
    .unwrap();
    assert_eq!(cfg.fifo_size, 8);
    assert_eq!(cfg.seg_size, 4096);
    assert_eq!(cfg.strategy, Some(Strategy::Centralized));
    assert!(cfg.multi_thread);
    assert_eq!(cfg.fifo_elem_size, 128);
}

#[test]
fn auto_strategy_means_none() {
    let cfg = CollIfaceConfig::from_lookup(lookup(&[(ENV_STRATEGY, "auto")])).unwrap();
    assert_eq!(cfg.strategy, None);
}

#[test]
fn bad_values_are_config_errors() {
    for vars in [
        [(ENV_FIFO_SIZE, "12")],
        [(ENV_FIFO_SIZE, "many")],
        [(ENV_STRATEGY, "fastest")],
        [(ENV_MT, "maybe")],
    ] {
        let err = CollIfaceConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, CollError::InvalidConfig(_)), "{vars:?}: {err}");
    }
}

#[test]
fn validate_rejects_bad_geometry() {
    let base = CollIfaceConfig::default();
    for cfg in [
        CollIfaceConfig { fifo_size: 1, ..base.clone() },
        CollIfaceConfig { fifo_elem_size: 64, ..base.clone() },
        CollIfaceConfig { fifo_elem_size: 200, ..base.clone() },
        CollIfaceConfig { fifo_poll_count: 0, ..base.clone() },
        CollIfaceConfig { seg_size: 2, ..base.clone() },
    ] {
        assert!(cfg.validate().is_err(), "{cfg:?}");
    }
}

#[test]
fn incast_elements_grow_with_group() {
    let cfg = CollIfaceConfig::default();
    assert_eq!(cfg.short_stride(), 64);
    assert_eq!(cfg.fifo_geometry(IfaceKind::Broadcast, 4).elem_size, 128);
    // three writer slots plus the dummy slot
    assert_eq!(cfg.fifo_geometry(IfaceKind::Incast, 4).elem_size, 64 + 4 * 64);
    assert_eq!(cfg.bcopy_stride(4), 2048);
}

#[test]
fn strategy_binding_by_group_size() {
    let cfg = CollIfaceConfig {
        centralized_threshold: 4,
        ..Default::default()
    };
    let small = CollIface::open(&cfg, IfaceParams::new(IfaceKind::Incast, 0, 4)).unwrap();
    let large = CollIface::open(&cfg, IfaceParams::new(IfaceKind::Incast, 0, 5)).unwrap();
    assert_eq!(small.strategy(), Strategy::Batched);
    assert_eq!(large.strategy(), Strategy::Centralized);
}

#[test]
fn locked_strategy_needs_reducer() {
    let cfg = CollIfaceConfig {
        strategy: Some(Strategy::Locked),
        ..Default::default()
    };
    let err = CollIface::open(&cfg, IfaceParams::new(IfaceKind::Incast, 0, 3)).err();
    assert!(matches!(err, Some(CollError::InvalidParam(_))));

    let params = IfaceParams::new(IfaceKind::Incast, 0, 3)
        .with_reducer(Reducer::builtin(ReduceOp::Sum, mmcoll::Dtype::F32));
    assert!(CollIface::open(&cfg, params).is_ok());
}

#[test]
fn group_parameters_are_checked() {
    let cfg = CollIfaceConfig::default();
    for params in [
        IfaceParams::new(IfaceKind::Broadcast, 0, 1),
        IfaceParams::new(IfaceKind::Broadcast, 3, 3),
        IfaceParams::new(IfaceKind::Incast, 0, 300),
    ] {
        assert!(matches!(
            CollIface::open(&cfg, params),
            Err(CollError::InvalidParam(_))
        ));
    }
}

#[test]
fn no_group_info_means_pair() {
    let iface = CollIface::open(
        &CollIfaceConfig::default(),
        IfaceParams::without_group(IfaceKind::Broadcast),
    )
    .unwrap();
    assert_eq!(iface.my_id(), 0);
    assert_eq!(iface.proc_count(), 2);
}

#[test]
fn seg_too_small_for_group() {
    let cfg = CollIfaceConfig {
        seg_size: 16,
        ..Default::default()
    };
    let err = CollIface::open(&cfg, IfaceParams::new(IfaceKind::Incast, 0, 16)).err();
    assert!(matches!(err, Some(CollError::InvalidConfig(_))));
}
