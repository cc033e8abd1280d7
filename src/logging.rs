// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use logforth::color::LevelColor;
use logforth::filter::EnvFilter;
use logforth::{Layout, append};

/// Default filter if `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "ordersim=info,warn";

/// Prints only the colored level and the message.
#[derive(Clone, Copy, Debug)]
struct StepLogLayout;

impl Layout for StepLogLayout {
    fn format(
        &self,
        record: &log::Record,
        _: &[Box<dyn logforth::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let colors = LevelColor::default();
        let level = colors.colorize_record_level(false, record.level());
        let message = record.args();
        Ok(format!("{level:>5} {message}").into_bytes())
    }
}

/// Installs `logforth` with the compact layout, logging to stderr.
pub fn enable_logforth() {
    enable_logforth_append(append::Stderr::default().with_layout(StepLogLayout));
}

fn enable_logforth_append<A: logforth::Append>(to_append: A) {
    let filter = EnvFilter::from_default_env_or(DEFAULT_FILTER);
    logforth::builder()
        .dispatch(|d| d.filter(filter).append(to_append))
        .apply();
}
