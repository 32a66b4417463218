//! Classification throughput: linear matcher vs RFC engine.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meter_classifier::{Classifier, RfcClassifier, SimpleClassifier};
use meter_common::{
    Filter, FlowTimeout, MatchKind, ModuleSpec, PacketMeta, RefPoint, Rule, RuleState,
};

fn port_rule(uid: u32, port: u16) -> Rule {
    Rule {
        uid,
        set_name: "bench".into(),
        rule_name: format!("p{port}"),
        state: RuleState::New,
        start: 0,
        stop: None,
        duration_s: None,
        bidir: false,
        sep_paths: false,
        auto_flows: false,
        flow_timeout: FlowTimeout::Off,
        interval: None,
        filters: vec![
            Filter {
                name: "proto".into(),
                refer: RefPoint::Ip,
                offs: 9,
                len: 1,
                mask: vec![0xff],
                def_mask: vec![0xff],
                kind: MatchKind::Exact,
                values: vec![vec![6]],
                reverse: None,
            },
            Filter {
                name: "dstport".into(),
                refer: RefPoint::Trans,
                offs: 2,
                len: 2,
                mask: vec![0xff, 0xff],
                def_mask: vec![0xff, 0xff],
                kind: MatchKind::Exact,
                values: vec![port.to_be_bytes().to_vec()],
                reverse: None,
            },
        ],
        actions: vec![ModuleSpec::new("count")],
        exports: vec![ModuleSpec::new("text")],
    }
}

fn tcp_packet(dport: u16) -> (PacketMeta, Vec<u8>) {
    let mut p = vec![0u8; 54];
    p[12] = 0x08;
    p[14] = 0x45;
    p[23] = 6;
    p[26..30].copy_from_slice(&[192, 168, 1, 1]);
    p[30..34].copy_from_slice(&[10, 0, 0, 1]);
    p[34..36].copy_from_slice(&12345u16.to_be_bytes());
    p[36..38].copy_from_slice(&dport.to_be_bytes());
    let mut meta = PacketMeta::default();
    meta.cap_len = 54;
    meta.wire_len = 54;
    meta.offs = [0, 14, 34, 54];
    (meta, p)
}

fn bench_classify(c: &mut Criterion) {
    let rules: Vec<Rule> = (0..256).map(|i| port_rule(i, i as u16)).collect();
    let refs: Vec<&Rule> = rules.iter().collect();

    let mut simple = SimpleClassifier::new();
    simple.add_rules(&refs).unwrap();
    let mut rfc = RfcClassifier::new();
    rfc.add_rules(&refs).unwrap();

    let (meta, payload) = tcp_packet(128);

    c.bench_function("classify_simple_256_rules", |b| {
        b.iter(|| {
            let mut m = meta.clone();
            black_box(simple.classify(&mut m, black_box(&payload)))
        })
    });

    c.bench_function("classify_rfc_256_rules", |b| {
        b.iter(|| {
            let mut m = meta.clone();
            black_box(rfc.classify(&mut m, black_box(&payload)))
        })
    });
}

criterion_group!(benches, bench_classify);
criterion_main!(benches);
