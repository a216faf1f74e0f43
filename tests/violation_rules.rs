use toolguard::{Anchor, BBox, Detection, FrameMeta, PipelineConfig, RoleLabels, Zone};

fn meta(frame_id: u64) -> FrameMeta {
    FrameMeta {
        stream_id: "line_1".into(),
        frame_id,
        timestamp_ms: frame_id * 200,
    }
}

fn det(label: &str, conf: f32, b: [f32; 4]) -> Detection {
    Detection::new(label, conf, BBox::from(b))
}

/// Prep table on the left, serving counter on the right.
fn two_zone_config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.zones = vec![
        Zone::new("prep", BBox::new(0.0, 0.0, 300.0, 480.0)),
        Zone::new("counter", BBox::new(340.0, 0.0, 640.0, 480.0)),
    ];
    cfg
}

#[test]
fn any_zone_counts_and_the_gap_between_them_does_not() {
    let engine = two_zone_config().engine();

    let in_counter = vec![
        det("hand", 0.9, [400.0, 100.0, 480.0, 200.0]),
        det("pizza", 0.9, [420.0, 120.0, 560.0, 260.0]),
    ];
    assert_eq!(engine.evaluate(&meta(1), &in_counter).len(), 1);

    // Centre at x = 320, between the zones.
    let in_gap = vec![
        det("hand", 0.9, [290.0, 100.0, 350.0, 200.0]),
        det("pizza", 0.9, [280.0, 120.0, 360.0, 260.0]),
    ];
    assert!(engine.evaluate(&meta(2), &in_gap).is_empty());
}

#[test]
fn configured_anchor_is_used_for_zone_membership() {
    let mut cfg = PipelineConfig::default();
    cfg.zones = vec![Zone::new("low", BBox::new(0.0, 250.0, 640.0, 480.0))];
    let hand = det("hand", 0.9, [100.0, 100.0, 200.0, 300.0]);
    let item = det("pizza", 0.9, [120.0, 160.0, 280.0, 320.0]);
    let dets = vec![hand, item];

    // Centre (150, 200) is above the zone; bottom centre (150, 300) is in it.
    assert!(cfg.engine().evaluate(&meta(1), &dets).is_empty());
    cfg.anchor = Anchor::BottomCenter;
    assert_eq!(cfg.engine().evaluate(&meta(1), &dets).len(), 1);
}

#[test]
fn configured_labels_define_roles() {
    let mut cfg = two_zone_config();
    cfg.labels = RoleLabels {
        hands: vec!["glove".into(), "hand".into()],
        items: vec!["dough".into()],
        tools: vec!["spatula".into()],
    };
    let engine = cfg.engine();

    let gloved = vec![
        det("glove", 0.9, [100.0, 150.0, 200.0, 300.0]),
        det("dough", 0.9, [120.0, 160.0, 280.0, 320.0]),
    ];
    let found = engine.evaluate(&meta(1), &gloved);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].boxes.hand.label, "glove");
    assert_eq!(found[0].boxes.item.label, "dough");

    // "pizza" and "scooper" carry no role under these labels.
    let unlabelled = vec![
        det("hand", 0.9, [100.0, 150.0, 200.0, 300.0]),
        det("pizza", 0.9, [120.0, 160.0, 280.0, 320.0]),
    ];
    assert!(engine.evaluate(&meta(2), &unlabelled).is_empty());

    let with_tool = vec![
        det("hand", 0.9, [100.0, 150.0, 200.0, 300.0]),
        det("spatula", 0.9, [190.0, 140.0, 260.0, 310.0]),
        det("dough", 0.9, [120.0, 160.0, 280.0, 320.0]),
    ];
    assert!(engine.evaluate(&meta(3), &with_tool).is_empty());
}

#[test]
fn assessment_keeps_surviving_detections_even_without_violations() {
    let engine = two_zone_config().engine();
    let dets = vec![
        det("hand", 0.9, [100.0, 150.0, 200.0, 300.0]),
        // Duplicate of the hand above.
        det("hand", 0.6, [102.0, 152.0, 201.0, 301.0]),
        det("scooper", 0.2, [190.0, 140.0, 260.0, 310.0]),
    ];
    let assessment = engine.assess(&meta(1), &dets);
    assert!(assessment.violations.is_empty());
    assert_eq!(assessment.detections.len(), 1);
    assert_eq!(assessment.detections[0].confidence, 0.9);
}
