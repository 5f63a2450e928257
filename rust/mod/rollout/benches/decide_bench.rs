use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tempfile::TempDir;

use bundlenudge_kv::{KVStore, RedbStore};
use rollout::model::{DeviceCheckIn, InstallOutcome, RollbackReason};
use rollout::{CreateRelease, RolloutConfig, RolloutService, bucket};

fn service(tmp: &TempDir) -> Arc<RolloutService> {
    let kv: Arc<dyn KVStore> = Arc::new(RedbStore::open(&tmp.path().join("bench.redb")).unwrap());
    RolloutService::new(kv, RolloutConfig::default())
}

fn check_in(device: String) -> DeviceCheckIn {
    DeviceCheckIn {
        device_id: device,
        app_id: "app".into(),
        channel: None,
        current_version: "1.0.0".into(),
        platform: "ios".into(),
        os_version: "17.0".into(),
        app_version: "5.0.0".into(),
        locale: None,
        custom: BTreeMap::new(),
    }
}

fn bench_bucket(c: &mut Criterion) {
    c.bench_function("bucket", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let device = format!("device-{}", i);
            black_box(bucket::bucket(black_box(&device), black_box("release-1")));
            i += 1;
        });
    });
}

fn bench_decide(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let svc = service(&tmp);
    svc.ensure_default_channels("app").unwrap();

    // One promoted release plus a partial rollout on top of it.
    for (version, promote) in [("1.1.0", true), ("1.2.0", false)] {
        let r = svc
            .create_release(CreateRelease {
                app_id: "app".into(),
                channel: "production".into(),
                version: version.into(),
                bundle_ref: format!("bundles/{}.js", version),
                min_os_version: Some("14.0".into()),
                targeting_rules: None,
                release_notes: None,
            })
            .unwrap();
        svc.start_rollout(&r.id, 25).unwrap();
        if promote {
            svc.promote(&r.id).unwrap();
        }
    }

    c.bench_function("decide_two_candidates", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let decision = svc.decide(black_box(&check_in(format!("device-{}", i % 1000)))).unwrap();
            black_box(decision);
            i += 1;
        });
    });
}

fn bench_report(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let svc = service(&tmp);

    c.bench_function("report_failed_start", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let outcome = InstallOutcome::Failed {
                report_id: Some(format!("report-{}", i)),
                reason: RollbackReason::CrashDetected,
                previous_version: None,
            };
            svc.report_outcome(&format!("device-{}", i), "release-1", outcome).unwrap();
            i += 1;
        });
    });
}

criterion_group!(benches, bench_bucket, bench_decide, bench_report);
criterion_main!(benches);
