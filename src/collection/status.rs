// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-archive audit of gathered collections (`data_collection_status.csv`).

use chrono::{DateTime, SecondsFormat, Utc};

use super::Collection;

/// Archive file name of the status table.
pub const STATUS_FILENAME: &str = "data_collection_status.csv";

/// Version recorded in the manifest for the status table.
pub const STATUS_VERSION: &str = "1.0";

/// Header line of the status table.
pub const STATUS_HEADER: &str = "collection_start_timestamp,since,until,file_name,status,elapsed";

/// Render one row per collection, in order.
///
/// `elapsed` is whole seconds between start and finish, 0 when either is unknown.
pub fn render_status<'a>(collections: impl IntoIterator<Item = &'a Collection>) -> String {
    let mut out = String::from(STATUS_HEADER);
    out.push('\n');

    for collection in collections {
        let status = if collection.is_successful() { "ok" } else { "failed" };
        let elapsed = match (collection.started_at, collection.finished_at) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0),
            _ => 0,
        };
        let row = [
            collection.started_at.map(timestamp).unwrap_or_default(),
            timestamp(collection.since),
            timestamp(collection.until),
            quote(&collection.filename()),
            status.to_string(),
            elapsed.to_string(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
