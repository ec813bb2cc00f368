use chrono::{Duration, NaiveDate};
use oxilink_lib::report::{decode_header, decode_samples, Mode, Report};
use pretty_assertions::assert_eq;

#[test]
fn test_reference_header_vector() {
    let info = decode_header(&hex::decode("14060112993005220012").unwrap()).unwrap();
    let start = NaiveDate::from_ymd_opt(2014, 6, 1)
        .unwrap()
        .and_hms_opt(12, 30, 5)
        .unwrap();

    assert_eq!(info.start, start);
    assert_eq!(info.end, start + Duration::seconds((18 / 3) * 5 - 5));
    assert_eq!(info.interval_seconds, 5);
    assert_eq!(info.mode, Mode::Adult);
}

#[test]
fn test_reference_sample_vector() {
    let samples = decode_samples(&hex::decode("5e00325e0037").unwrap());
    assert_eq!(samples.sp02, vec![0x5e, 0x5e]);
    assert_eq!(samples.pulse, vec![0x32, 0x37]);
}

#[test]
fn test_report_export_round_trip() {
    let report = Report::new(2, "14060208991504420009", "6000486100496200");

    let json = serde_json::to_string(&report).unwrap();
    let back: Report = serde_json::from_str(&json).unwrap();
    assert_eq!(back, report);

    let summary = back.summary().unwrap();
    assert_eq!(summary.mode, Mode::Pediatric);
    assert_eq!(summary.interval_seconds, 4);
    assert_eq!(summary.duration_seconds, 8);
    assert_eq!(summary.sample_count, 2);
}
