#![forbid(unsafe_code)]

//! Property-based checks of the resample grid.
//!
//! Inputs are small random tables of dated, categorized integer amounts so
//! that sums are exact in `f64` and expected values can be recomputed with a
//! plain `BTreeMap`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta};
use proptest::prelude::*;

use tg_resample::{DataFrame, ResampleOptions, resample, resample_with_options};
use tg_types::Scalar;

#[derive(Debug, Clone)]
struct Row {
    ts: NaiveDateTime,
    region: &'static str,
    channel: &'static str,
    amount: i64,
}

// ---------------------------------------------------------------------------
// Strategy generators
// ---------------------------------------------------------------------------

fn base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2023, 12, 20)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// A row within ~80 days of the base date, at any minute of the day.
fn arb_row() -> impl Strategy<Value = Row> {
    (
        0i64..80,
        0i64..(24 * 60),
        prop::sample::select(vec!["north", "south", "east"]),
        prop::sample::select(vec!["web", "store"]),
        -500i64..500,
    )
        .prop_map(|(days, minutes, region, channel, amount)| Row {
            ts: base() + TimeDelta::days(days) + TimeDelta::minutes(minutes),
            region,
            channel,
            amount,
        })
}

fn arb_rows(max_len: usize) -> impl Strategy<Value = Vec<Row>> {
    proptest::collection::vec(arb_row(), 1..=max_len)
}

fn arb_frequency() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["D", "2D", "W", "M"])
}

fn to_frame(rows: &[Row]) -> DataFrame {
    DataFrame::from_dict(vec![
        (
            "date",
            rows.iter()
                .map(|r| Scalar::from(r.ts.format("%Y-%m-%d %H:%M:%S").to_string()))
                .collect(),
        ),
        ("region", rows.iter().map(|r| Scalar::from(r.region)).collect()),
        ("channel", rows.iter().map(|r| Scalar::from(r.channel)).collect()),
        ("amount", rows.iter().map(|r| Scalar::Int64(r.amount)).collect()),
    ])
    .expect("frame")
}

/// Reference bucketing for the generated frequencies.
fn bucket_of(ts: NaiveDateTime, freq: &str) -> NaiveDateTime {
    let date = ts.date();
    let start = match freq {
        "D" => date,
        "2D" => {
            let epoch_days = date.num_days_from_ce() - 719_163;
            let floored = epoch_days.div_euclid(2) * 2;
            NaiveDate::from_num_days_from_ce_opt(floored + 719_163).expect("date")
        }
        "W" => date - TimeDelta::days(i64::from(date.weekday().num_days_from_monday())),
        "M" => NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("date"),
        other => panic!("unexpected frequency {other}"),
    };
    start.and_hms_opt(0, 0, 0).expect("time")
}

fn expected_bucket_count(rows: &[Row], freq: &str) -> usize {
    let lo = rows.iter().map(|r| bucket_of(r.ts, freq)).min().expect("rows");
    let hi = rows.iter().map(|r| bucket_of(r.ts, freq)).max().expect("rows");
    match freq {
        "D" => usize::try_from((hi - lo).num_days() + 1).expect("count"),
        "2D" => usize::try_from((hi - lo).num_days() / 2 + 1).expect("count"),
        "W" => usize::try_from((hi - lo).num_days() / 7 + 1).expect("count"),
        _ => {
            let months = |ts: NaiveDateTime| i64::from(ts.year()) * 12 + i64::from(ts.month0());
            usize::try_from(months(hi) - months(lo) + 1).expect("count")
        }
    }
}

type CellKey = (NaiveDateTime, String, String);

fn expected_sums(rows: &[Row], freq: &str) -> BTreeMap<CellKey, i64> {
    let mut sums = BTreeMap::new();
    for r in rows {
        *sums
            .entry((
                bucket_of(r.ts, freq),
                r.region.to_owned(),
                r.channel.to_owned(),
            ))
            .or_insert(0) += r.amount;
    }
    sums
}

fn output_cells(out: &DataFrame) -> Vec<(CellKey, f64)> {
    out.to_records()
        .into_iter()
        .map(|row| {
            let text = |name: &str| match &row[name] {
                Scalar::Utf8(s) => s.clone(),
                other => other.to_string(),
            };
            (
                (
                    row["date"].as_timestamp().expect("timestamp"),
                    text("region"),
                    text("channel"),
                ),
                row["amount"].to_f64().expect("numeric"),
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Grid shape
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Output rows = buckets in [min, max] × distinct observed combinations.
    #[test]
    fn prop_grid_is_complete(rows in arb_rows(40), freq in arb_frequency()) {
        let out = resample(&to_frame(&rows), "date", "amount", freq, 0.0).expect("resample");

        let combos: BTreeSet<_> = rows.iter().map(|r| (r.region, r.channel)).collect();
        prop_assert_eq!(out.len(), expected_bucket_count(&rows, freq) * combos.len());

        let cells: BTreeSet<CellKey> = output_cells(&out).into_iter().map(|(k, _)| k).collect();
        prop_assert_eq!(cells.len(), out.len(), "grid cells must be distinct");
    }

    /// Buckets ascend; within a bucket, combinations repeat in one fixed order.
    #[test]
    fn prop_grid_is_bucket_major(rows in arb_rows(40), freq in arb_frequency()) {
        let out = resample(&to_frame(&rows), "date", "amount", freq, 0.0).expect("resample");
        let cells = output_cells(&out);

        let combos: BTreeSet<_> = rows.iter().map(|r| (r.region, r.channel)).collect();
        let width = combos.len();
        let first_block: Vec<_> = cells[..width]
            .iter()
            .map(|((_, region, channel), _)| (region.clone(), channel.clone()))
            .collect();

        for (i, chunk) in cells.chunks(width).enumerate() {
            let bucket = chunk[0].0.0;
            prop_assert!(chunk.iter().all(|((b, _, _), _)| *b == bucket));
            if i > 0 {
                prop_assert!(cells[(i - 1) * width].0.0 < bucket);
            }
            let block: Vec<_> = chunk
                .iter()
                .map(|((_, region, channel), _)| (region.clone(), channel.clone()))
                .collect();
            prop_assert_eq!(&block, &first_block);
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Observed cells carry their exact sum; every other cell carries the fill.
    #[test]
    fn prop_sums_and_fills_are_exact(
        rows in arb_rows(40),
        freq in arb_frequency(),
        fill in -10_000i64..10_000,
    ) {
        let fill = fill as f64 + 0.25;
        let out = resample(&to_frame(&rows), "date", "amount", freq, fill).expect("resample");
        let expected = expected_sums(&rows, freq);

        for (key, value) in output_cells(&out) {
            match expected.get(&key) {
                Some(sum) => prop_assert_eq!(value, *sum as f64, "sum for {:?}", key),
                None => prop_assert_eq!(value, fill, "fill for {:?}", key),
            }
        }
    }

    /// Dropping the filled cells, output amounts total the input amounts.
    #[test]
    fn prop_no_data_loss(rows in arb_rows(40), freq in arb_frequency()) {
        let out = resample(&to_frame(&rows), "date", "amount", freq, 0.0).expect("resample");
        let expected = expected_sums(&rows, freq);

        let observed_total: f64 = output_cells(&out)
            .into_iter()
            .filter(|(key, _)| expected.contains_key(key))
            .map(|(_, value)| value)
            .sum();
        let input_total: i64 = rows.iter().map(|r| r.amount).sum();
        prop_assert_eq!(observed_total, input_total as f64);
    }

    /// Feeding the output back in at the same frequency changes nothing.
    #[test]
    fn prop_resample_is_idempotent(rows in arb_rows(30), freq in arb_frequency()) {
        let first = resample(&to_frame(&rows), "date", "amount", freq, 0.0).expect("first");
        let second = resample(&first, "date", "amount", freq, 0.0).expect("second");
        prop_assert!(first.semantic_eq(&second));
    }

    /// Execution options choose an allocation strategy, never an answer.
    #[test]
    fn prop_arena_and_global_paths_agree(rows in arb_rows(40), freq in arb_frequency()) {
        let frame = to_frame(&rows);
        let arena = ResampleOptions::new("date", "amount").with_frequency(freq);
        let mut global = arena.clone();
        global.groupby.use_arena = false;
        global.join.use_arena = false;

        let a = resample_with_options(&frame, &arena).expect("arena");
        let g = resample_with_options(&frame, &global).expect("global");
        prop_assert!(a.semantic_eq(&g));
    }
}
