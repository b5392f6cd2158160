use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use tagflush_log::LogError;

use crate::key::graphite_name;
use crate::snapshot::RawMetricsSnapshot;

/// Rewrites every key of a snapshot into its multi-dimensional Graphite name.
///
/// Keys are transformed with [`graphite_name`]. Entries whose key cannot be transformed are logged
/// and dropped. Values, `pctThreshold` and all other fields are carried over unchanged.
///
/// If two keys map to the same name, the entry with the greater raw key wins and the collision is
/// logged.
pub fn remap_snapshot(snapshot: &RawMetricsSnapshot) -> RawMetricsSnapshot {
    RawMetricsSnapshot {
        counters: remap_entries("counters", &snapshot.counters),
        gauges: remap_entries("gauges", &snapshot.gauges),
        sets: remap_entries("sets", &snapshot.sets),
        counter_rates: remap_entries("counter_rates", &snapshot.counter_rates),
        timers: remap_entries("timers", &snapshot.timers),
        timer_data: remap_entries("timer_data", &snapshot.timer_data),
        pct_threshold: snapshot.pct_threshold.clone(),
        other: snapshot.other.clone(),
    }
}

fn remap_entries<V: Clone>(category: &str, entries: &BTreeMap<String, V>) -> BTreeMap<String, V> {
    let mut remapped = BTreeMap::new();

    for (raw_key, value) in entries {
        match graphite_name(raw_key) {
            Ok(name) => match remapped.entry(name.into_owned()) {
                Entry::Vacant(entry) => {
                    entry.insert(value.clone());
                }
                Entry::Occupied(mut entry) => {
                    tagflush_log::warn!(
                        "{category} entry {raw_key:?} replaces an earlier entry named {:?}",
                        entry.key()
                    );
                    entry.insert(value.clone());
                }
            },
            Err(error) => {
                tagflush_log::error!(
                    "dropping {category} entry with malformed key {raw_key:?}: {}",
                    LogError(&error)
                );
            }
        }
    }

    remapped
}
