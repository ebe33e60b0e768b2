use chrono::{FixedOffset, NaiveDate};

use crate::config::Config;
use crate::model::*;

use super::EngineError;

// ── Interval arithmetic ──────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Sort and merge an arbitrary set of spans.
pub fn union(spans: &[Span]) -> Vec<Span> {
    let mut sorted = spans.to_vec();
    sorted.sort_by_key(|s| s.start);
    merge_overlapping(&sorted)
}

/// Both inputs must be sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

/// Free sub-intervals of `base` once every busy span is removed.
/// `busy` may be unsorted and self-overlapping.
pub fn subtract(base: Span, busy: &[Span]) -> Vec<Span> {
    subtract_intervals(&[base], &union(busy))
}

// ── Resolution ───────────────────────────────────────────────────

/// Mark each slot available iff its window on `date` overlaps nothing busy.
/// Output order follows `slots`.
pub fn resolve_slots(
    slots: &[SlotDefinition],
    date: NaiveDate,
    offset: FixedOffset,
    local_busy: &[Span],
    remote_busy: &[Span],
) -> Result<Vec<SlotAvailability>, EngineError> {
    let mut busy = Vec::with_capacity(local_busy.len() + remote_busy.len());
    busy.extend_from_slice(local_busy);
    busy.extend_from_slice(remote_busy);
    let busy = union(&busy);

    slots
        .iter()
        .map(|slot| {
            let span = slot.span_on(date, offset)?;
            // busy is sorted by start: skip everything that starts at or after span.end.
            let candidates = busy.partition_point(|b| b.start < span.end);
            let available = !busy[..candidates].iter().any(|b| b.overlaps(&span));
            Ok(SlotAvailability {
                slot: slot.clone(),
                span,
                available,
            })
        })
        .collect()
}

/// The window asked of the external calendar: the working day, widened to
/// cover any slot that starts earlier or ends later.
pub fn query_window(
    config: &Config,
    date: NaiveDate,
    slots: &[SlotDefinition],
) -> Result<Span, EngineError> {
    let mut window = Span::new(
        local_instant(date, config.working_day_start, config.utc_offset)?,
        local_instant(date, config.working_day_end, config.utc_offset)?,
    );
    for slot in slots {
        let span = slot.span_on(date, config.utc_offset)?;
        window.start = window.start.min(span.start);
        window.end = window.end.max(span.end);
    }
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()
    }

    fn slot(start_h: u32, end_h: u32) -> SlotDefinition {
        SlotDefinition {
            id: Ulid::new(),
            start_of_day: NaiveTime::from_hms_opt(start_h, 0, 0).unwrap(),
            end_of_day: NaiveTime::from_hms_opt(end_h, 0, 0).unwrap(),
            price_cents: 20_000,
            active: true,
        }
    }

    fn at(h: Ms) -> Ms {
        local_instant(date(), NaiveTime::MIN, utc()).unwrap() + h * H
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let result = subtract_intervals(&base, &[Span::new(200, 300)]);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 250)]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        assert_eq!(
            subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 150)]),
            vec![Span::new(150, 200)]
        );
        assert_eq!(
            subtract_intervals(&[Span::new(100, 200)], &[Span::new(150, 250)]),
            vec![Span::new(100, 150)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        assert_eq!(
            subtract_intervals(&[Span::new(0, 1000)], &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    #[test]
    fn subtract_unsorted_overlapping_busy() {
        let busy = vec![Span::new(600, 700), Span::new(150, 300), Span::new(100, 200)];
        assert_eq!(
            subtract(Span::new(0, 1000), &busy),
            vec![Span::new(0, 100), Span::new(300, 600), Span::new(700, 1000)]
        );
    }

    #[test]
    fn subtract_ignores_busy_outside_base() {
        let busy = vec![Span::new(0, 50), Span::new(2000, 3000)];
        assert_eq!(subtract(Span::new(100, 200), &busy), vec![Span::new(100, 200)]);
    }

    // ── merge / union ────────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(500, 600)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    #[test]
    fn union_sorts_first() {
        let spans = vec![Span::new(500, 600), Span::new(100, 300), Span::new(250, 400)];
        assert_eq!(union(&spans), vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    // ── subtract partition property ──────────────────────

    fn random_span(rng: &mut StdRng, lo: Ms, hi: Ms) -> Span {
        let start = rng.gen_range(lo..hi);
        let end = rng.gen_range(start + 1..=hi);
        Span::new(start, end)
    }

    #[test]
    fn subtract_partitions_base() {
        let mut rng = StdRng::seed_from_u64(0x5107);
        for _ in 0..500 {
            let base = random_span(&mut rng, 0, 1000);
            let busy: Vec<Span> = (0..rng.gen_range(0..8))
                .map(|_| random_span(&mut rng, -200, 1200))
                .collect();
            let free = subtract(base, &busy);

            // Free pieces stay inside base, are disjoint and avoid busy.
            for w in free.windows(2) {
                assert!(w[0].end < w[1].start, "free pieces must be disjoint and non-adjacent");
            }
            for f in &free {
                assert!(base.contains_span(f));
                assert!(busy.iter().all(|b| !b.overlaps(f)));
            }

            // Every instant of base is free xor covered by busy.
            for t in base.start..base.end {
                let is_free = free.iter().any(|f| f.contains_instant(t));
                let is_busy = busy.iter().any(|b| b.contains_instant(t));
                assert_ne!(is_free, is_busy, "instant {t} of {base:?} with {busy:?}");
            }
        }
    }

    // ── resolve_slots ────────────────────────────────────

    #[test]
    fn resolve_single_free_slot() {
        let slots = vec![slot(10, 12)];
        let result = resolve_slots(&slots, date(), utc(), &[], &[]).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result[0].available);
        assert_eq!(result[0].span, Span::new(at(10), at(12)));
    }

    #[test]
    fn resolve_empty_catalog() {
        let result = resolve_slots(&[], date(), utc(), &[Span::new(0, 1)], &[]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn resolve_merges_local_and_remote() {
        let slots = vec![slot(8, 10), slot(10, 12), slot(12, 14), slot(14, 16)];
        let local = vec![Span::new(at(10), at(12))];
        let remote = vec![Span::new(at(13), at(13) + 1)];
        let flags: Vec<bool> = resolve_slots(&slots, date(), utc(), &local, &remote)
            .unwrap()
            .iter()
            .map(|s| s.available)
            .collect();
        assert_eq!(flags, vec![true, false, false, true]);
    }

    #[test]
    fn resolve_adjacent_busy_keeps_slot_free() {
        let slots = vec![slot(10, 12)];
        let busy = vec![Span::new(at(8), at(10)), Span::new(at(12), at(14))];
        assert!(resolve_slots(&slots, date(), utc(), &busy, &[]).unwrap()[0].available);
    }

    #[test]
    fn resolve_keeps_catalog_order() {
        let slots = vec![slot(14, 16), slot(8, 10)];
        let result = resolve_slots(&slots, date(), utc(), &[], &[]).unwrap();
        assert_eq!(result[0].slot.id, slots[0].id);
        assert_eq!(result[1].slot.id, slots[1].id);
    }

    #[test]
    fn resolve_matches_pairwise_overlap() {
        let mut rng = StdRng::seed_from_u64(0xA7A1);
        let slots: Vec<SlotDefinition> = (6..20).map(|h| slot(h, h + 1)).collect();
        for _ in 0..300 {
            let busy: Vec<Span> = (0..rng.gen_range(0..6))
                .map(|_| random_span(&mut rng, at(5), at(22)))
                .collect();
            let split = rng.gen_range(0..=busy.len());
            let (local, remote) = busy.split_at(split);
            for sa in resolve_slots(&slots, date(), utc(), local, remote).unwrap() {
                let expected = busy.iter().all(|b| !b.overlaps(&sa.span));
                assert_eq!(sa.available, expected, "{:?} vs {busy:?}", sa.span);
            }
        }
    }

    // ── query_window ─────────────────────────────────────

    #[test]
    fn query_window_covers_working_day_and_slots() {
        let config = Config::default();
        let window = query_window(&config, date(), &[]).unwrap();
        assert_eq!(window, Span::new(at(9), at(20)));

        let window = query_window(&config, date(), &[slot(8, 10), slot(19, 21)]).unwrap();
        assert_eq!(window, Span::new(at(8), at(21)));
    }
}
