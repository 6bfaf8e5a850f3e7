use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use fib_algo::addr::Prefix;
use fib_algo::test_types::{TestModule, TestNexthop, TestRib};
use fib_algo::{
    CalloutService, Family, FibAlgoConfig, FlmRegistry, LookupKey, NhopHandle,
    Scope,
};
use rand::Rng;

mod common {
    use std::io::Write;

    pub fn init() {
        let _ = env_logger::builder()
            .format(|buf, record| writeln!(buf, "{}", record.args()))
            .is_test(true)
            .try_init();
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(20) {
        fib_algo::epoch::pin().flush();
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn fast_config() -> FibAlgoConfig {
    FibAlgoConfig {
        eval_delay_ms: 5,
        eval_num_routes: 10,
        callout_delay_ms: 1,
        max_callout_delay_ms: 8,
        ..Default::default()
    }
}

#[test]
fn test_churn_with_concurrent_lookups() -> Result<(), Box<dyn std::error::Error>> {
    crate::common::init();

    let registry = Arc::new(FlmRegistry::new());
    let a = TestModule::new("A", Family::Inet, 100);
    let b = TestModule::new("B", Family::Inet, 90);
    let (a_ctl, b_ctl) = (a.ctl(), b.ctl());
    a_ctl.fail_change_every(7);
    b_ctl.fail_change_every(11);
    let a_id = registry.register(a);
    let b_id = registry.register(b);

    let scope = Arc::new(Scope::new(
        registry.clone(),
        fast_config(),
        CalloutService::threaded()?,
    ));

    let nhops: Vec<NhopHandle> =
        (0..40).map(|i| Arc::new(TestNexthop::new(i)) as NhopHandle).collect();
    let rib = TestRib::new(Family::Inet, 0);
    // never touched by the churn below
    rib.add_route(Prefix::from_str("10.0.0.0/8")?, nhops[1].clone());
    for i in 0..50u32 {
        rib.add_route(
            Prefix::from_str(&format!("172.16.{}.0/24", i))?,
            nhops[(i % 8) as usize].clone(),
        );
    }
    scope.attach_table(rib.clone())?;

    let stop = Arc::new(AtomicBool::new(false));
    let lookups = Arc::new(AtomicUsize::new(0));
    let readers: Vec<_> = (0..3)
        .map(|n| {
            let scope = scope.clone();
            let stop = stop.clone();
            let lookups = lookups.clone();
            std::thread::Builder::new()
                .name(format!("reader-{}", n))
                .spawn(move || {
                    let stable = LookupKey::new(IpAddr::from_str("10.1.2.3").unwrap());
                    while !stop.load(Ordering::Acquire) {
                        let nh = scope.lookup(0, &stable);
                        assert_eq!(nh.map(|nh| nh.index()), Some(1));
                        lookups.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .unwrap()
        })
        .collect();

    let mut rng = rand::rng();
    for round in 0..2_000u32 {
        let pfx = Prefix::from_str(&format!(
            "172.{}.{}.0/24",
            16 + rng.random_range(0..4u32),
            rng.random_range(0..64u32)
        ))?;
        if rng.random_bool(0.3) {
            rib.delete_route(&pfx);
        } else {
            // occasionally beyond the current nexthop capacity
            let idx = rng.random_range(0..nhops.len());
            rib.add_route(pfx, nhops[idx].clone());
        }
        if round % 250 == 0 {
            // flip the favourite
            let (hi, lo) = if round % 500 == 0 {
                (&b_ctl, &a_ctl)
            } else {
                (&a_ctl, &b_ctl)
            };
            hi.set_pref(150);
            lo.set_pref(100);
        }
        if round % 100 == 0 {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    // let the last rebuilds settle
    std::thread::sleep(Duration::from_millis(50));
    stop.store(true, Ordering::Release);
    for r in readers {
        r.join().unwrap();
    }
    assert!(lookups.load(Ordering::Relaxed) > 0);
    println!("{}", scope.stats_json()?);
    if let Some(info) = scope.instance_info(Family::Inet, 0) {
        println!("{}", info);
    }

    scope.detach_table(Family::Inet, 0)?;
    rib.clear();
    assert_eq!(rib.subscriber_count(), 0);

    // every instance that was created gets torn down, exactly once
    assert!(wait_for(|| {
        a_ctl.destroy_calls() == a_ctl.init_calls()
            && b_ctl.destroy_calls() == b_ctl.init_calls()
    }));
    // and nothing keeps a nexthop alive
    assert!(wait_for(|| nhops.iter().all(|nh| Arc::strong_count(nh) == 1)));

    drop(scope);
    assert!(wait_for(|| registry.unregister(a_id).is_ok()));
    assert!(wait_for(|| registry.unregister(b_id).is_ok()));
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn test_concurrent_attach_detach() -> Result<(), Box<dyn std::error::Error>> {
    crate::common::init();

    let registry = Arc::new(FlmRegistry::new());
    let a = TestModule::new("A", Family::Inet6, 100);
    let a_ctl = a.ctl();
    registry.register(a);
    let scope = Arc::new(Scope::new(
        registry,
        FibAlgoConfig {
            num_tables: 4,
            ..fast_config()
        },
        CalloutService::threaded()?,
    ));

    let threads: Vec<_> = (0..4u32)
        .map(|n| {
            let scope = scope.clone();
            std::thread::spawn(move || -> Result<(), String> {
                let rib = TestRib::new(Family::Inet6, n);
                rib.add_route(
                    Prefix::from_str("2001:db8::/32").map_err(|e| e.to_string())?,
                    Arc::new(TestNexthop::new(n)),
                );
                let key = LookupKey::new(IpAddr::from_str("2001:db8::1").unwrap());
                for _ in 0..50 {
                    scope.attach_table(rib.clone()).map_err(|e| e.to_string())?;
                    if scope.lookup(n, &key).map(|nh| nh.index()) != Some(n) {
                        return Err(format!("table {} lookup failed", n));
                    }
                    scope
                        .detach_table(Family::Inet6, n)
                        .map_err(|e| e.to_string())?;
                }
                Ok(())
            })
        })
        .collect();
    for t in threads {
        t.join().map_err(|_| "thread panicked")??;
    }

    assert_eq!(a_ctl.init_calls(), 200);
    assert!(wait_for(|| a_ctl.destroy_calls() == 200));
    assert_eq!(scope.num_tables(Family::Inet6), 4);
    Ok(())
}

#[test]
fn test_detach_during_rebuild() -> Result<(), Box<dyn std::error::Error>> {
    crate::common::init();

    let registry = Arc::new(FlmRegistry::new());
    let a = TestModule::new("A", Family::Inet, 100);
    let a_ctl = a.ctl();
    a_ctl.set_incremental(false);
    registry.register(a);
    let scope = Arc::new(Scope::new(
        registry,
        fast_config(),
        CalloutService::threaded()?,
    ));

    let nh: NhopHandle = Arc::new(TestNexthop::new(1));
    let rib = TestRib::new(Family::Inet, 0);
    rib.add_route(Prefix::from_str("10.0.0.0/8")?, nh.clone());
    scope.attach_table(rib.clone())?;
    assert_eq!(a_ctl.init_calls(), 1);

    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    a_ctl.gate_next_init(entered.clone(), release.clone());

    // a non-incremental module rebuilds on every change
    rib.add_route(Prefix::from_str("192.0.2.0/24")?, nh.clone());

    // the rebuild is now running on the callout thread
    entered.wait();
    assert_eq!(a_ctl.init_calls(), 2);

    let detached = Arc::new(AtomicBool::new(false));
    let detacher = {
        let scope = scope.clone();
        let detached = detached.clone();
        std::thread::spawn(move || {
            let res = scope.detach_table(Family::Inet, 0);
            detached.store(true, Ordering::Release);
            res.map_err(|e| e.to_string())
        })
    };

    // detaching waits for the firing in progress
    std::thread::sleep(Duration::from_millis(50));
    assert!(!detached.load(Ordering::Acquire));
    assert!(scope.lookup(0, &LookupKey::new(IpAddr::from_str("10.1.1.1")?)).is_none());

    release.wait();
    detacher.join().map_err(|_| "detacher panicked")??;
    assert!(detached.load(Ordering::Acquire));

    // the rebuilt candidate found its table gone and was discarded
    assert_eq!(a_ctl.init_calls(), 2);
    assert_eq!(rib.subscriber_count(), 0);
    assert_eq!(scope.instance_count(Family::Inet, 0), 0);
    assert!(scope.instance_info(Family::Inet, 0).is_none());
    assert!(scope.lookup(0, &LookupKey::new(IpAddr::from_str("10.1.1.1")?)).is_none());
    assert_eq!(scope.callouts().pending(), 0);

    // both instances are released, once each
    assert!(wait_for(|| a_ctl.destroy_calls() == 2));
    // what is left are the two routes and our own handle
    assert!(wait_for(|| Arc::strong_count(&nh) == 3));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(a_ctl.destroy_calls(), a_ctl.init_calls());
    Ok(())
}
