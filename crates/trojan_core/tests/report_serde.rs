use trojan_core::{ClassificationReport, MadSide};

#[test]
fn report_serializes_for_metrics_log() {
    let y_true = [false, false, false, true, true, true];
    let y_pred = [false, false, true, true, true, true];
    let report = ClassificationReport::from_labels(&y_true, &y_pred).unwrap();
    let json = serde_json::to_value(report).unwrap();
    assert_eq!(json["true_positive"], 3);
    assert_eq!(json["false_positive"], 1);
    assert!((json["recall"].as_f64().unwrap() - 1.0).abs() < 1e-12);

    let back: ClassificationReport = serde_json::from_value(json).unwrap();
    assert_eq!(back, report);
}

#[test]
fn mad_side_uses_snake_case() {
    let side: MadSide = serde_json::from_str("\"double\"").unwrap();
    assert_eq!(side, MadSide::Double);
}
