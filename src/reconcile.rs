// ===============================
// src/reconcile.rs
// ===============================
//
// Pure merge rules. Nothing here awaits: callers hold the store lock for the
// whole read-modify-write.

use std::time::Duration;

use ahash::AHashMap as HashMap;

use crate::domain::{Bbo, Order, OrderStatus, Sequenced, TimePoint};

/// Fold an incoming order view into the stored one, field by field.
pub fn merge_order(stored: &Order, incoming: &Order) -> Order {
    let mut merged = stored.clone();

    let mut fill_increased = false;
    if let Some(q) = incoming.cumulative_filled_quantity {
        if stored.cumulative_filled_quantity.map_or(true, |s| q > s) {
            fill_increased = stored.cumulative_filled_quantity.is_some() || !q.is_zero();
            merged.cumulative_filled_quantity = Some(q);
        }
    }
    if let Some(q) = incoming.cumulative_filled_quote_quantity {
        if stored.cumulative_filled_quote_quantity.map_or(true, |s| q > s) {
            merged.cumulative_filled_quote_quantity = Some(q);
        }
    }

    if merged.order_id.is_none() {
        merged.order_id = incoming.order_id.clone();
    }
    if incoming.price.is_some() && incoming.price != stored.price {
        merged.price = incoming.price;
    }
    if incoming.quantity.is_some() && incoming.quantity != stored.quantity {
        merged.quantity = incoming.quantity;
    }
    if merged.exchange_create_time_point.is_none() {
        merged.exchange_create_time_point = incoming.exchange_create_time_point;
    }
    merged.exchange_update_time_point =
        latest(stored.exchange_update_time_point, incoming.exchange_update_time_point);
    merged.local_update_time_point =
        latest(stored.local_update_time_point, incoming.local_update_time_point);
    if merged.api_method.is_none() {
        merged.api_method = incoming.api_method;
    }

    merged.status = stored.status.max(incoming.status);
    // a fill moves an unfilled order forward even when the reported status lags
    if fill_increased && merged.status < OrderStatus::PartiallyFilled {
        merged.status = OrderStatus::PartiallyFilled;
    }

    merged
}

fn latest(a: Option<TimePoint>, b: Option<TimePoint>) -> Option<TimePoint> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Latest-wins; a missing timestamp on either side always lets the update through.
pub fn should_replace_bbo(stored: &Bbo, incoming: &Bbo) -> bool {
    match (stored.exchange_update_time_point, incoming.exchange_update_time_point) {
        (Some(s), Some(i)) => i >= s,
        _ => true,
    }
}

/// Sort by sequence key and drop duplicate keys, keeping the last revision.
pub fn sort_dedup<T: Sequenced>(records: &mut Vec<T>) {
    records.sort_by_key(|r| r.sequence_key());
    records.dedup_by(|later, kept| {
        if later.sequence_key() == kept.sequence_key() {
            std::mem::swap(later, kept);
            true
        } else {
            false
        }
    });
}

pub fn group_by_symbol<T: Sequenced>(records: Vec<T>) -> HashMap<String, Vec<T>> {
    let mut out: HashMap<String, Vec<T>> = HashMap::new();
    for r in records {
        out.entry(r.symbol().to_string()).or_default().push(r);
    }
    out
}

/// Prepend the sorted records strictly older than the current head. Returns how
/// many were added.
pub fn splice_before_head<T: Sequenced>(existing: &mut Vec<T>, sorted: Vec<T>) -> usize {
    let older: Vec<T> = match existing.first().map(|r| r.sequence_key()) {
        Some(head) => sorted
            .into_iter()
            .filter(|r| r.sequence_key() < head)
            .collect(),
        None => sorted,
    };
    let added = older.len();
    if added > 0 {
        existing.splice(0..0, older);
    }
    added
}

/// Append sorted records strictly newer than the current tail. For revisable
/// series a record matching the tail key replaces it.
pub fn append_after_tail<T: Sequenced>(existing: &mut Vec<T>, sorted: Vec<T>) -> usize {
    let mut added = 0;
    for r in sorted {
        let key = r.sequence_key();
        match existing.last().map(|t| t.sequence_key()) {
            Some(tail) if key < tail => {}
            Some(tail) if key == tail => {
                if T::REVISABLE_TAIL {
                    if let Some(slot) = existing.last_mut() {
                        *slot = r;
                        added += 1;
                    }
                }
            }
            _ => {
                existing.push(r);
                added += 1;
            }
        }
    }
    added
}

pub fn backfill_series<T: Sequenced>(series: &mut HashMap<String, Vec<T>>, batch: Vec<T>) -> usize {
    let mut added = 0;
    for (symbol, mut records) in group_by_symbol(batch) {
        sort_dedup(&mut records);
        added += splice_before_head(series.entry(symbol).or_default(), records);
    }
    added
}

pub fn append_series<T: Sequenced>(series: &mut HashMap<String, Vec<T>>, batch: Vec<T>) -> usize {
    let mut added = 0;
    for (symbol, mut records) in group_by_symbol(batch) {
        sort_dedup(&mut records);
        added += append_after_tail(series.entry(symbol).or_default(), records);
    }
    added
}

/// Oldest time point still inside `window` when the newest record is at `latest`.
pub fn retention_cutoff(latest: TimePoint, window: Duration) -> Option<TimePoint> {
    let window = chrono::Duration::from_std(window).ok()?;
    latest.checked_sub_signed(window)
}

/// Keep records with time >= newest - window. Returns how many were removed.
pub fn prune_series<T: Sequenced>(existing: &mut Vec<T>, window: Duration) -> usize {
    let Some(cutoff) = existing
        .last()
        .and_then(|t| retention_cutoff(t.time_point(), window))
    else {
        return 0;
    };
    let before = existing.len();
    existing.retain(|r| r.time_point() >= cutoff);
    before - existing.len()
}
