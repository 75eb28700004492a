use tracing::{debug, info};

use crate::error::{RecapError, Result};
use crate::models::{CountMap, SourceTable};

/// Count qualifying records per trimmed group value.
///
/// A record qualifies when both `key_a` and `key_b` are present. Text that
/// trims to nothing counts as missing; any number counts as present.
/// Records whose group value is blank are not counted.
pub fn aggregate(source: &SourceTable, key_a: &str, key_b: &str, group: &str) -> Result<CountMap> {
    let idx_a = require(source, key_a)?;
    let idx_b = require(source, key_b)?;
    let idx_group = require(source, group)?;

    let mut counts = CountMap::new();
    let mut excluded = 0usize;
    for row in &source.rows {
        let present = |idx: usize| row.get(idx).is_some_and(|v| !v.is_blank());
        if !present(idx_a) || !present(idx_b) {
            excluded += 1;
            continue;
        }
        let Some(value) = row.get(idx_group) else {
            excluded += 1;
            continue;
        };
        let group_value = value.to_string();
        let group_value = group_value.trim();
        if group_value.is_empty() {
            debug!("qualifying record has no {group}, skipped");
            excluded += 1;
            continue;
        }
        counts.increment(group_value);
    }

    info!(
        groups = counts.len(),
        counted = counts.total(),
        excluded,
        "aggregated source records"
    );
    Ok(counts)
}

fn require(source: &SourceTable, field: &str) -> Result<usize> {
    source
        .column_index(field.trim())
        .ok_or_else(|| RecapError::schema(field.trim()))
}
