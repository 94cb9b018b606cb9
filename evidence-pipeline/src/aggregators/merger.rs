use crate::types::RawInterval;

/// Missing frame-times tolerated between two runs of the same label.
pub const MAX_BRIDGED_GAP: i64 = 1;

/// Collapses one label's time-ordered runs, bridging gaps of a single frame.
///
/// `(5,7)` and `(9,9)` become `(5,9)`; `(5,7)` and `(10,12)` stay apart.
pub fn merge_intervals(intervals: &[RawInterval]) -> Vec<RawInterval> {
    let mut merged = Vec::new();
    let mut iter = intervals.iter();

    let mut current = match iter.next() {
        Some(first) => first.clone(),
        None => return merged,
    };

    for interval in iter {
        if interval.start.saturating_sub(current.end).saturating_sub(1) <= MAX_BRIDGED_GAP {
            current.end = current.end.max(interval.end);
        } else {
            merged.push(std::mem::replace(&mut current, interval.clone()));
        }
    }
    merged.push(current);

    merged
}
