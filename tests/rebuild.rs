use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fib_algo::addr::Prefix;
use fib_algo::errors::AlgoResult;
use fib_algo::stats::SchedState;
use fib_algo::test_types::{TestModule, TestNexthop, TestRib};
use fib_algo::{CalloutService, Family, FibAlgoConfig, FlmRegistry, LookupKey, Scope};

mod common {
    use std::io::Write;

    pub fn init() {
        let _ = env_logger::builder()
            .format(|buf, record| writeln!(buf, "{}", record.args()))
            .is_test(true)
            .try_init();
    }
}

fn key(addr: &str) -> LookupKey {
    LookupKey::new(IpAddr::from_str(addr).unwrap())
}

fn pfx(s: &str) -> Prefix {
    Prefix::from_str(s).unwrap()
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(10) {
        fib_algo::epoch::pin().flush();
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn test_nexthop_capacity_doubles() -> Result<(), Box<dyn std::error::Error>> {
    crate::common::init();

    let registry = Arc::new(FlmRegistry::new());
    let a = TestModule::new("A", Family::Inet, 100);
    let a_ctl = a.ctl();
    registry.register(a);
    let scope = Scope::new(
        registry,
        FibAlgoConfig::default(),
        CalloutService::manual(),
    );

    let rib = TestRib::new(Family::Inet, 0);
    for i in 1..=5u32 {
        rib.add_route(pfx(&format!("10.{}.0.0/16", i)), TestNexthop::handle(i));
    }
    scope.attach_table(rib.clone())?;
    let info = scope.instance_info(Family::Inet, 0).ok_or("no instance")?;
    assert_eq!(info.nhop_capacity, 16);
    assert!(!info.hit_nhops);

    rib.add_route(pfx("192.0.2.0/24"), TestNexthop::handle(16));
    let info = scope.instance_info(Family::Inet, 0).ok_or("no instance")?;
    assert!(info.hit_nhops);
    assert_eq!(info.state, SchedState::RebuildPending);
    // the change never reached the module
    assert_eq!(a_ctl.change_calls(), 0);

    scope.callouts().advance(Duration::from_millis(50));
    let info = scope.instance_info(Family::Inet, 0).ok_or("no instance")?;
    assert_eq!(info.nhop_capacity, 32);
    assert_eq!(info.nhop_count, 6);
    assert!(!info.hit_nhops);
    assert_eq!(a_ctl.init_calls(), 2);
    assert_eq!(a_ctl.init_with_prev.load(std::sync::atomic::Ordering::Acquire), 1);
    assert_eq!(scope.stats().rebuilds, 1);
    assert_eq!(
        scope.lookup(0, &key("192.0.2.1")).map(|nh| nh.index()),
        Some(16)
    );
    Ok(())
}

#[test]
fn test_error_quarantines_and_switches() -> Result<(), Box<dyn std::error::Error>> {
    crate::common::init();

    let registry = Arc::new(FlmRegistry::new());
    let a = TestModule::new("A", Family::Inet, 200);
    let b = TestModule::new("B", Family::Inet, 100);
    let (a_ctl, b_ctl) = (a.ctl(), b.ctl());
    a_ctl.fail_change_at(10, AlgoResult::Error);
    registry.register(a);
    registry.register(b);
    let scope = Scope::new(
        registry,
        FibAlgoConfig {
            num_tables: 2,
            ..Default::default()
        },
        CalloutService::manual(),
    );
    let rib = TestRib::new(Family::Inet, 0);
    rib.add_route(pfx("10.0.0.0/8"), TestNexthop::handle(1));
    scope.attach_table(rib.clone())?;
    assert_eq!(scope.algo_name(Family::Inet, 0).as_deref(), Some("A"));

    for i in 0..10 {
        rib.add_route(pfx(&format!("172.16.{}.0/24", i)), TestNexthop::handle(2));
    }
    assert!(scope.is_quarantined(Family::Inet, 0, "A"));
    let info = scope.instance_info(Family::Inet, 0).ok_or("no instance")?;
    assert_eq!(info.state, SchedState::RebuildPending);

    scope.callouts().advance(Duration::from_millis(50));
    assert_eq!(scope.algo_name(Family::Inet, 0).as_deref(), Some("B"));
    assert_eq!(scope.stats().switches, 1);
    assert_eq!(b_ctl.dump_calls(), 11);
    assert_eq!(
        scope.lookup(0, &key("172.16.9.1")).map(|nh| nh.index()),
        Some(2)
    );
    assert!(wait_for(|| a_ctl.destroy_calls() == 1));

    // A keeps the better score, but is out of the running for this table
    rib.add_route(pfx("192.0.2.0/24"), TestNexthop::handle(3));
    scope.callouts().advance(Duration::from_secs(30));
    assert_eq!(scope.algo_name(Family::Inet, 0).as_deref(), Some("B"));
    assert_eq!(a_ctl.init_calls(), 1);

    // and still available for others
    let other = TestRib::new(Family::Inet, 1);
    other.add_route(pfx("10.0.0.0/8"), TestNexthop::handle(1));
    scope.attach_table(other)?;
    assert_eq!(scope.algo_name(Family::Inet, 1).as_deref(), Some("A"));
    Ok(())
}

#[test]
fn test_rebuild_backoff() -> Result<(), Box<dyn std::error::Error>> {
    crate::common::init();

    let registry = Arc::new(FlmRegistry::new());
    let a = TestModule::new("A", Family::Inet, 100);
    let a_ctl = a.ctl();
    a_ctl.fail_change_at(1, AlgoResult::NeedsRebuild);
    registry.register(a);
    let scope = Scope::new(
        registry,
        FibAlgoConfig::default(),
        CalloutService::manual(),
    );
    let rib = TestRib::new(Family::Inet, 0);
    rib.add_route(pfx("10.0.0.0/8"), TestNexthop::handle(1));
    scope.attach_table(rib.clone())?;

    a_ctl.fail_init(Some(AlgoResult::NeedsRebuild));
    rib.add_route(pfx("192.0.2.0/24"), TestNexthop::handle(2));

    // first attempt after the base delay: 32 tries, all failing
    scope.callouts().advance(Duration::from_millis(50));
    assert_eq!(a_ctl.init_calls(), 1 + 32);
    let info = scope.instance_info(Family::Inet, 0).ok_or("no instance")?;
    assert_eq!(info.failed_rebuilds, 1);
    assert_eq!(info.state, SchedState::RebuildPending);
    assert_eq!(scope.stats().failed_rebuilds, 1);
    assert!(scope.lookup(0, &key("10.1.1.1")).is_some());

    // then twice the delay
    scope.callouts().advance(Duration::from_millis(99));
    assert_eq!(a_ctl.init_calls(), 1 + 32);
    scope.callouts().advance(Duration::from_millis(1));
    assert_eq!(a_ctl.init_calls(), 1 + 64);

    // 200ms on, the module has recovered
    a_ctl.fail_init(None);
    scope.callouts().advance(Duration::from_millis(200));
    assert_eq!(a_ctl.init_calls(), 1 + 64 + 1);
    let info = scope.instance_info(Family::Inet, 0).ok_or("no instance")?;
    assert_eq!(info.failed_rebuilds, 0);
    assert_eq!(info.state, SchedState::Stable);
    assert_eq!(scope.stats().rebuilds, 1);
    assert!(scope.lookup(0, &key("192.0.2.1")).is_some());
    Ok(())
}

#[test]
fn test_quarantine_without_alternative() -> Result<(), Box<dyn std::error::Error>> {
    crate::common::init();

    let registry = Arc::new(FlmRegistry::new());
    let a = TestModule::new("A", Family::Inet, 100);
    let a_ctl = a.ctl();
    a_ctl.fail_change_at(1, AlgoResult::Error);
    registry.register(a);
    let scope = Scope::new(
        registry,
        FibAlgoConfig::default(),
        CalloutService::manual(),
    );
    let rib = TestRib::new(Family::Inet, 0);
    rib.add_route(pfx("10.0.0.0/8"), TestNexthop::handle(1));
    scope.attach_table(rib.clone())?;

    rib.add_route(pfx("192.0.2.0/24"), TestNexthop::handle(2));
    scope.callouts().advance(Duration::from_millis(50));

    // nothing to switch to: keep forwarding with the old instance
    let info = scope.instance_info(Family::Inet, 0).ok_or("no instance")?;
    assert_eq!(info.algo, "A");
    assert_eq!(info.failed_rebuilds, 1);
    assert_eq!(info.state, SchedState::RebuildPending);
    assert_eq!(a_ctl.init_calls(), 1);
    assert!(scope.lookup(0, &key("10.1.1.1")).is_some());

    scope.callouts().advance(Duration::from_millis(100));
    let info = scope.instance_info(Family::Inet, 0).ok_or("no instance")?;
    assert_eq!(info.failed_rebuilds, 2);
    Ok(())
}

#[test]
fn test_detach_with_rebuild_pending() -> Result<(), Box<dyn std::error::Error>> {
    crate::common::init();

    let registry = Arc::new(FlmRegistry::new());
    let a = TestModule::new("A", Family::Inet, 100);
    let a_ctl = a.ctl();
    a_ctl.set_incremental(false);
    registry.register(a);
    let scope = Scope::new(
        registry,
        FibAlgoConfig::default(),
        CalloutService::manual(),
    );
    let rib = TestRib::new(Family::Inet, 0);
    rib.add_route(pfx("10.0.0.0/8"), TestNexthop::handle(1));
    scope.attach_table(rib.clone())?;

    rib.add_route(pfx("192.0.2.0/24"), TestNexthop::handle(2));
    assert_eq!(scope.callouts().pending(), 1);

    scope.detach_table(Family::Inet, 0)?;
    assert_eq!(scope.callouts().pending(), 0);
    assert_eq!(scope.instance_count(Family::Inet, 0), 0);
    assert!(scope.lookup(0, &key("10.1.1.1")).is_none());
    assert!(scope.instance_info(Family::Inet, 0).is_none());

    scope.callouts().advance(Duration::from_secs(60));
    assert_eq!(a_ctl.init_calls(), 1);
    assert!(wait_for(|| a_ctl.destroy_calls() == 1));
    Ok(())
}

#[test]
fn test_dying_table() -> Result<(), Box<dyn std::error::Error>> {
    crate::common::init();

    let registry = Arc::new(FlmRegistry::new());
    let a = TestModule::new("A", Family::Inet, 100);
    let a_ctl = a.ctl();
    a_ctl.fail_change_at(1, AlgoResult::NeedsRebuild);
    registry.register(a);
    let scope = Scope::new(
        registry,
        FibAlgoConfig::default(),
        CalloutService::manual(),
    );
    let rib = TestRib::new(Family::Inet, 0);
    rib.add_route(pfx("10.0.0.0/8"), TestNexthop::handle(1));
    scope.attach_table(rib.clone())?;

    rib.add_route(pfx("192.0.2.0/24"), TestNexthop::handle(2));
    rib.set_dying(true);
    scope.callouts().advance(Duration::from_millis(50));

    // the rebuild found the table going away and gave up on it
    assert_eq!(a_ctl.init_calls(), 2);
    assert!(scope.is_quarantined(Family::Inet, 0, "A"));
    let info = scope.instance_info(Family::Inet, 0).ok_or("no instance")?;
    assert_eq!(info.failed_rebuilds, 1);

    scope.detach_table(Family::Inet, 0)?;
    assert!(!scope.is_quarantined(Family::Inet, 0, "A"));
    Ok(())
}
