#![forbid(unsafe_code)]

//! End-to-end resample scenarios over frames and records.

use chrono::{NaiveDate, NaiveDateTime};
use tg_resample::{
    DataFrame, ErrorKind, EvidenceLedger, Record, ResampleError, ResampleOptions,
    ResamplePolicy, resample, resample_records, resample_with_options, resample_with_policy,
};
use tg_types::{NullKind, Scalar};

fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .expect("date")
        .and_hms_opt(0, 0, 0)
        .expect("time")
}

fn record(entries: &[(&str, Scalar)]) -> Record {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

/// Collect `(date, category, value)` triples from a single-category output.
fn triples(out: &DataFrame, category: &str, value: &str) -> Vec<(NaiveDateTime, String, f64)> {
    (0..out.len())
        .map(|i| {
            let row = out.row(i).expect("row");
            let ts = row["date"].as_timestamp().expect("timestamp");
            let cat = match &row[category] {
                Scalar::Utf8(s) => s.clone(),
                other => other.to_string(),
            };
            let v = row[value].to_f64().expect("numeric");
            (ts, cat, v)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario 1: three sparse rows densified across days × regions
// ---------------------------------------------------------------------------

#[test]
fn daily_grid_fills_absent_cells() {
    let frame = DataFrame::from_dict(vec![
        (
            "date",
            vec![
                Scalar::from("2024-01-01"),
                Scalar::from("2024-01-03"),
                Scalar::from("2024-01-02"),
            ],
        ),
        (
            "region",
            vec![Scalar::from("A"), Scalar::from("A"), Scalar::from("B")],
        ),
        (
            "amount",
            vec![Scalar::Int64(5), Scalar::Int64(2), Scalar::Int64(7)],
        ),
    ])
    .expect("frame");
    let before = frame.clone();

    let out = resample(&frame, "date", "amount", "D", 0.0).expect("resample");

    assert_eq!(out.len(), 6);
    assert_eq!(out.column_names(), &["date", "region", "amount"]);
    assert_eq!(
        triples(&out, "region", "amount"),
        vec![
            (day(2024, 1, 1), "A".to_owned(), 5.0),
            (day(2024, 1, 1), "B".to_owned(), 0.0),
            (day(2024, 1, 2), "A".to_owned(), 0.0),
            (day(2024, 1, 2), "B".to_owned(), 7.0),
            (day(2024, 1, 3), "A".to_owned(), 2.0),
            (day(2024, 1, 3), "B".to_owned(), 0.0),
        ]
    );
    // The caller's frame is read, never rewritten.
    assert!(frame.semantic_eq(&before));
}

#[test]
fn zero_row_input_is_empty_input() {
    let frame = DataFrame::from_dict(vec![
        ("date", Vec::new()),
        ("region", Vec::new()),
        ("amount", Vec::new()),
    ])
    .expect("frame");

    let err = resample(&frame, "date", "amount", "D", 0.0).expect_err("empty");
    assert!(matches!(err, ResampleError::EmptyInput));
    assert_eq!(err.kind(), ErrorKind::EmptyInput);
}

#[test]
fn missing_value_column_is_schema_error() {
    let frame = DataFrame::from_dict(vec![
        ("date", vec![Scalar::from("2024-01-01")]),
        ("qty", vec![Scalar::Int64(1)]),
    ])
    .expect("frame");

    let err = resample(&frame, "date", "amount", "D", 0.0).expect_err("schema");
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert!(matches!(err, ResampleError::Schema { ref column, row: None } if column == "amount"));
}

#[test]
fn without_categories_rows_equal_bucket_count() {
    let frame = DataFrame::from_dict(vec![
        (
            "date",
            vec![
                Scalar::from("2024-02-27 08:00:00"),
                Scalar::from("2024-03-02 17:45:00"),
                Scalar::from("2024-02-27 23:59:59"),
            ],
        ),
        (
            "amount",
            vec![Scalar::Float64(1.5), Scalar::Float64(4.0), Scalar::Float64(2.5)],
        ),
    ])
    .expect("frame");

    let out = resample(&frame, "date", "amount", "D", 0.0).expect("resample");

    // 02-27 through 03-02 in a leap year.
    assert_eq!(out.len(), 5);
    assert_eq!(out.column_names(), &["date", "amount"]);
    assert_eq!(
        out.column("amount").expect("amount").values(),
        &[
            Scalar::Float64(4.0),
            Scalar::Float64(0.0),
            Scalar::Float64(0.0),
            Scalar::Float64(0.0),
            Scalar::Float64(4.0)
        ]
    );
}

// ---------------------------------------------------------------------------
// Scenario 2: coarser calendar frequencies
// ---------------------------------------------------------------------------

fn spread_frame() -> DataFrame {
    DataFrame::from_dict(vec![
        (
            "date",
            vec![
                Scalar::from("2023-11-20"),
                Scalar::from("2024-02-03"),
                Scalar::from("2023-11-02"),
                Scalar::from("2024-02-28"),
            ],
        ),
        (
            "product",
            vec![
                Scalar::from("tea"),
                Scalar::from("tea"),
                Scalar::from("coffee"),
                Scalar::from("coffee"),
            ],
        ),
        (
            "units",
            vec![
                Scalar::Int64(3),
                Scalar::Int64(4),
                Scalar::Int64(10),
                Scalar::Int64(1),
            ],
        ),
    ])
    .expect("frame")
}

#[test]
fn monthly_buckets_start_on_the_first() {
    let out = resample(&spread_frame(), "date", "units", "M", -1.0).expect("monthly");

    // Nov, Dec, Jan, Feb × {tea, coffee}.
    assert_eq!(out.len(), 8);
    let rows = triples(&out, "product", "units");
    assert_eq!(rows[0], (day(2023, 11, 1), "tea".to_owned(), 3.0));
    assert_eq!(rows[1], (day(2023, 11, 1), "coffee".to_owned(), 10.0));
    assert_eq!(rows[2], (day(2023, 12, 1), "tea".to_owned(), -1.0));
    assert_eq!(rows[6], (day(2024, 2, 1), "tea".to_owned(), 4.0));
    assert_eq!(rows[7], (day(2024, 2, 1), "coffee".to_owned(), 1.0));
}

#[test]
fn yearly_buckets_collapse_the_spread() {
    let out = resample(&spread_frame(), "date", "units", "Y", 0.0).expect("yearly");

    assert_eq!(
        triples(&out, "product", "units"),
        vec![
            (day(2023, 1, 1), "tea".to_owned(), 3.0),
            (day(2023, 1, 1), "coffee".to_owned(), 10.0),
            (day(2024, 1, 1), "tea".to_owned(), 4.0),
            (day(2024, 1, 1), "coffee".to_owned(), 1.0),
        ]
    );
}

#[test]
fn quarter_end_labels_and_weekly_starts() {
    let quarterly = resample(&spread_frame(), "date", "units", "QE", 0.0).expect("quarterly");
    let labels: Vec<_> = quarterly
        .column("date")
        .expect("date")
        .values()
        .iter()
        .step_by(2)
        .map(|v| v.as_timestamp().expect("timestamp"))
        .collect();
    assert_eq!(labels, vec![day(2023, 12, 31), day(2024, 3, 31)]);

    let weekly = resample(&spread_frame(), "date", "units", "W", 0.0).expect("weekly");
    // 2023-10-30 is the Monday on or before 2023-11-02.
    assert_eq!(
        weekly.column("date").expect("date").values()[0],
        Scalar::Timestamp(day(2023, 10, 30))
    );
}

#[test]
fn unknown_frequency_is_rejected_before_touching_rows() {
    let err = resample(&spread_frame(), "date", "units", "3X", 0.0).expect_err("freq");
    assert_eq!(err.kind(), ErrorKind::UnsupportedFrequency);
}

// ---------------------------------------------------------------------------
// Scenario 3: record input
// ---------------------------------------------------------------------------

#[test]
fn records_resample_like_frames() {
    let records = vec![
        record(&[
            ("date", Scalar::from("2024-01-01")),
            ("region", Scalar::from("A")),
            ("amount", Scalar::Int64(5)),
        ]),
        record(&[
            ("date", Scalar::from("2024-01-02T12:30:00Z")),
            ("region", Scalar::from("B")),
            ("amount", Scalar::Float64(2.5)),
        ]),
    ];
    let options = ResampleOptions::new("date", "amount").with_fill_value(f64::NAN);

    let out = resample_records(&records, &options).expect("records");
    assert_eq!(out.len(), 4);
    let amounts = out.column("amount").expect("amount").values();
    assert_eq!(amounts[0], Scalar::Float64(5.0));
    assert!(amounts[1].is_missing());
    assert!(amounts[2].is_missing());
    assert_eq!(amounts[3], Scalar::Float64(2.5));
}

#[test]
fn record_missing_value_key_names_the_row() {
    let records = vec![
        record(&[
            ("date", Scalar::from("2024-01-01")),
            ("amount", Scalar::Int64(5)),
        ]),
        record(&[("date", Scalar::from("2024-01-02"))]),
    ];

    let err = resample_records(&records, &ResampleOptions::new("date", "amount"))
        .expect_err("schema");
    assert!(matches!(err, ResampleError::Schema { row: Some(1), .. }));
}

#[test]
fn no_records_is_empty_input() {
    let err = resample_records(&[], &ResampleOptions::new("date", "amount")).expect_err("empty");
    assert_eq!(err.kind(), ErrorKind::EmptyInput);
}

// ---------------------------------------------------------------------------
// Scenario 4: dates given as integer nanoseconds and as timestamps
// ---------------------------------------------------------------------------

#[test]
fn epoch_nanosecond_dates_are_accepted() {
    let nanos_per_day = 86_400_i64 * 1_000_000_000;
    let frame = DataFrame::from_dict(vec![
        (
            "date",
            vec![
                Scalar::Int64(19_723 * nanos_per_day),
                Scalar::Int64(19_725 * nanos_per_day + 5),
            ],
        ),
        ("amount", vec![Scalar::Int64(1), Scalar::Int64(2)]),
    ])
    .expect("frame");

    let out = resample(&frame, "date", "amount", "D", 0.0).expect("resample");
    assert_eq!(out.len(), 3);
    assert_eq!(
        out.column("date").expect("date").values()[0],
        Scalar::Timestamp(day(2024, 1, 1))
    );
}

#[test]
fn resampling_the_output_again_is_identity() {
    let first = resample(&spread_frame(), "date", "units", "M", 0.0).expect("first");
    let second = resample(&first, "date", "units", "M", 0.0).expect("second");
    assert!(first.semantic_eq(&second));
}

// ---------------------------------------------------------------------------
// Scenario 5: policy and evidence
// ---------------------------------------------------------------------------

#[test]
fn hardened_run_leaves_a_json_trail() {
    let frame = DataFrame::from_dict(vec![
        (
            "date",
            vec![
                Scalar::from("2024-01-01"),
                Scalar::Null(NullKind::NaT),
                Scalar::from("2024-01-02"),
            ],
        ),
        (
            "amount",
            vec![Scalar::Int64(1), Scalar::Int64(9), Scalar::Int64(2)],
        ),
    ])
    .expect("frame");
    let options = ResampleOptions::new("date", "amount");

    let strict = resample_with_options(&frame, &options).expect_err("strict");
    assert_eq!(strict.kind(), ErrorKind::Parse);

    let mut ledger = EvidenceLedger::new();
    let policy = ResamplePolicy::hardened(Some(10));
    let out = resample_with_policy(&frame, &options, &policy, &mut ledger).expect("hardened");
    assert_eq!(
        out.column("amount").expect("amount").values(),
        &[Scalar::Int64(1), Scalar::Int64(2)]
    );

    let jsonl = ledger.to_jsonl().expect("jsonl");
    let lines: Vec<serde_json::Value> = jsonl
        .lines()
        .map(|line| serde_json::from_str(line).expect("json"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["action"], "repair");
    assert_eq!(lines[0]["issue"]["kind"], "missing_timestamp");
    assert_eq!(lines[1]["issue"]["detail"], "grid_rows=2 cap=10");
}
