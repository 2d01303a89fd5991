use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::model::*;

// ── Slot Computation ─────────────────────────────────────────────

/// Open intervals for one calendar date: the weekday's recurring ranges,
/// minus Block exceptions, union ExtraAvailable exceptions. Result is
/// sorted and disjoint. Existing lessons are not considered here.
pub fn day_open_intervals(state: &TeacherState, date: NaiveDate) -> Vec<Span> {
    let mut open: Vec<Span> = state
        .weekly_for(date.weekday())
        .map(|w| Span::new(date.and_time(w.start), date.and_time(w.end)))
        .collect();
    open.sort_by_key(|s| s.start);
    let mut open = merge_overlapping(&open);

    let mut blocks: Vec<Span> = Vec::new();
    let mut extra: Vec<Span> = Vec::new();
    for e in state.exceptions_for(date) {
        let span = Span::new(date.and_time(e.start), date.and_time(e.end));
        match e.kind {
            ExceptionKind::Block => blocks.push(span),
            ExceptionKind::ExtraAvailable => extra.push(span),
        }
    }

    blocks.sort_by_key(|s| s.start);
    if !blocks.is_empty() {
        open = subtract_intervals(&open, &blocks);
    }

    if !extra.is_empty() {
        open.extend(extra);
        open.sort_by_key(|s| s.start);
        open = merge_overlapping(&open);
    }

    open
}

/// No-go zones implied by active lessons around `window`: each Pending or
/// Confirmed lesson occupies `[start, end + buffer)`. The search reaches
/// back by `buffer` so a lesson whose trailing buffer spills into the
/// window is caught. Result is sorted and merged.
pub fn occupied_zones(state: &TeacherState, window: &Span) -> Vec<Span> {
    let buffer = Duration::minutes(state.policy.buffer_minutes as i64);
    let search = Span::new(window.start - buffer, window.end);
    let zones: Vec<Span> = state
        .active_lessons_overlapping(&search)
        .map(|l| Span::new(l.start, l.end() + buffer))
        .collect();
    // Lessons are sorted by start, so zones already are too.
    merge_overlapping(&zones)
}

/// Compute every bookable slot of `duration_minutes` for the inclusive date
/// range `[from, to]`, given the state snapshot and an explicit `now`.
///
/// Disabled policy yields no slots. Slot starts step back-to-back at the
/// requested duration within each free sub-interval. Starts before
/// `now + min_notice_hours` or on a date past `now + max_horizon_days` are
/// dropped. Output is sorted ascending and disjoint.
pub fn compute_slots(
    state: &TeacherState,
    from: NaiveDate,
    to: NaiveDate,
    duration_minutes: u32,
    now: NaiveDateTime,
) -> Vec<Slot> {
    if !state.policy.enabled || duration_minutes == 0 {
        return Vec::new();
    }
    let duration = Duration::minutes(duration_minutes as i64);
    let earliest = now + Duration::hours(state.policy.min_notice_hours as i64);
    let horizon_date = (now + Duration::days(state.policy.max_horizon_days as i64)).date();

    let mut slots = Vec::new();
    let mut date = from;
    while date <= to && date <= horizon_date {
        let next = match date.succ_opt() {
            Some(d) => d,
            None => break,
        };
        let window = Span::new(
            date.and_time(NaiveTime::MIN),
            next.and_time(NaiveTime::MIN),
        );

        let mut open = day_open_intervals(state, date);
        if !open.is_empty() {
            let busy = occupied_zones(state, &window);
            if !busy.is_empty() {
                open = subtract_intervals(&open, &busy);
            }
            for sub in &open {
                let mut start = sub.start;
                while start + duration <= sub.end {
                    if start >= earliest {
                        slots.push(Slot {
                            start,
                            duration_minutes,
                            end: start + duration,
                        });
                    }
                    start += duration;
                }
            }
        }

        date = next;
    }

    slots
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
