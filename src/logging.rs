// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// tracing subscriber setup for binaries and tests.

use std::sync::Once;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Filter directives, e.g. `MM_COLL_LOG=mmcoll=trace`.
pub const FILTER_ENV: &str = "MM_COLL_LOG";

static INIT: Once = Once::new();

fn filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy()
}

/// Install a compact stderr subscriber. Later calls, or a subscriber
/// installed by someone else, leave the existing one in place.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Like [`init`], but routes output through the test harness capture.
pub fn init_for_tests() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_test_writer()
            .try_init();
    });
}
