use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::Mutex;
use svckit::components::{
    BoundService, Cardinality, ComponentContext, ComponentDescription, ComponentInstance,
    ComponentMetadata, ReferenceMetadata,
};
use svckit::diagnostics::{CollectingSink, DiagnosticKind, Severity};
use svckit::properties::SERVICE_RANKING;
use svckit::{
    Bundle, ComponentError, ComponentRuntime, ComponentSettings, ComponentState, Framework,
    FrameworkEventKind, InterfaceMap, PropertyMap, ServiceObject,
};

type Log = Arc<Mutex<Vec<String>>>;

struct Recorder {
    name: String,
    log: Log,
    object: Option<ServiceObject>,
}

impl ComponentInstance for Recorder {
    fn activate(&self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        self.log.lock().push(format!("activate:{}", self.name));
        Ok(())
    }

    fn deactivate(&self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        self.log.lock().push(format!("deactivate:{}", self.name));
        Ok(())
    }

    fn bind(&self, reference: &str, service: &BoundService) -> anyhow::Result<()> {
        self.log
            .lock()
            .push(format!("bind:{}:{reference}:{}", self.name, service.reference.id()));
        Ok(())
    }

    fn unbind(&self, reference: &str, service: &BoundService) -> anyhow::Result<()> {
        self.log
            .lock()
            .push(format!("unbind:{}:{reference}:{}", self.name, service.reference.id()));
        Ok(())
    }

    fn service(&self) -> Option<ServiceObject> {
        self.object.clone()
    }
}

fn object_for(interfaces: &[String], name: &str) -> ServiceObject {
    let mut map = InterfaceMap::new();
    for interface in interfaces {
        let value: Arc<dyn Any + Send + Sync> = Arc::new(name.to_owned());
        map.insert_named(interface.clone(), value);
    }
    ServiceObject::new(map)
}

fn recorded(metadata: ComponentMetadata, log: &Log) -> ComponentDescription {
    let log = log.clone();
    let interfaces = metadata.provided_interfaces().to_vec();
    ComponentDescription::new(metadata, move |ctx: &ComponentContext| -> anyhow::Result<Arc<dyn ComponentInstance>> {
        let object = (!interfaces.is_empty()).then(|| object_for(&interfaces, ctx.component_name()));
        Ok(Arc::new(Recorder {
            name: ctx.component_name().to_owned(),
            log: log.clone(),
            object,
        }))
    })
}

struct Setup {
    fw: Framework,
    runtime: ComponentRuntime,
    bundle: Bundle,
    sink: Arc<CollectingSink>,
    log: Log,
}

fn setup() -> Setup {
    let sink = Arc::new(CollectingSink::new());
    let fw = Framework::builder().diagnostics(sink.clone()).build();
    fw.start();
    let runtime = ComponentRuntime::new(
        &fw,
        ComponentSettings {
            work_mode: svckit::components::WorkMode::Inline,
            ..Default::default()
        },
    );
    let bundle = fw.install("app");
    fw.start_bundle(&bundle).unwrap();
    Setup {
        fw,
        runtime,
        bundle,
        sink,
        log: Arc::default(),
    }
}

fn plain() -> InterfaceMap {
    InterfaceMap::new()
}

fn count(log: &Log, entry: &str) -> usize {
    log.lock().iter().filter(|e| *e == entry).count()
}

#[test]
fn immediate_component_follows_its_mandatory_reference() {
    let s = setup();
    let meta = ComponentMetadata::new("c")
        .provides(&["test.C"])
        .immediate(true)
        .reference(ReferenceMetadata::new("x", "test.X"));
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(meta, &s.log)]).unwrap();
    assert_eq!(s.runtime.state("c"), Some(ComponentState::Unsatisfied));
    assert_eq!(s.runtime.unsatisfied_references("c"), Some(vec!["x".to_owned()]));

    let ctx = s.fw.context(&s.bundle);
    let x = ctx.register_service(&["test.X"], plain(), PropertyMap::new()).unwrap();
    assert_eq!(s.runtime.state("c"), Some(ComponentState::Active));
    assert_eq!(count(&s.log, "activate:c"), 1);
    let published = ctx.find_reference("test.C").unwrap();
    assert_eq!(
        published.property("component.name").and_then(|v| v.as_str().map(str::to_owned)).as_deref(),
        Some("c")
    );

    x.unregister().unwrap();
    assert_eq!(s.runtime.state("c"), Some(ComponentState::Unsatisfied));
    assert_eq!(count(&s.log, "deactivate:c"), 1);
    assert!(ctx.find_reference("test.C").is_none());
}

#[test]
fn delayed_component_is_created_on_first_use() {
    let s = setup();
    let meta = ComponentMetadata::new("d").provides(&["test.D"]);
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(meta, &s.log)]).unwrap();
    assert_eq!(s.runtime.state("d"), Some(ComponentState::Satisfied));
    assert!(s.log.lock().is_empty());

    let consumer = s.fw.install("consumer");
    s.fw.start_bundle(&consumer).unwrap();
    let ctx = s.fw.context(&consumer);
    let r = ctx.find_reference("test.D").unwrap();
    let obj = ctx.get_service(&r).unwrap();
    assert!(obj.contains("test.D"));
    assert_eq!(s.runtime.state("d"), Some(ComponentState::Active));
    assert_eq!(*s.log.lock(), vec!["activate:d"]);

    ctx.unget_service(&r, None);
    assert_eq!(s.runtime.state("d"), Some(ComponentState::Satisfied));
    assert_eq!(*s.log.lock(), vec!["activate:d", "deactivate:d"]);
}

/// a -> b -> c -> a, each reference mandatory; `dynamic` names the components
/// whose reference is dynamic.
fn cycle(dynamic: &[&str], immediate: bool, log: &Log) -> Vec<ComponentDescription> {
    [("a", "test.A", "b", "test.B"), ("b", "test.B", "c", "test.C"), ("c", "test.C", "a", "test.A")]
        .into_iter()
        .map(|(name, provides, target, interface)| {
            let mut reference = ReferenceMetadata::new(target, interface);
            if dynamic.contains(&name) {
                reference = reference.dynamic();
            }
            let meta = ComponentMetadata::new(name)
                .provides(&[provides])
                .immediate(immediate)
                .reference(reference);
            recorded(meta, log)
        })
        .collect()
}

#[test]
fn cycle_with_dynamic_reference_resolves() {
    let s = setup();
    s.runtime.add_bundle_components(&s.bundle, cycle(&["a"], true, &s.log)).unwrap();

    for name in ["a", "b", "c"] {
        assert_eq!(s.runtime.state(name), Some(ComponentState::Active), "component {name}");
    }
    let a = s.runtime.configuration("a").unwrap();
    assert_eq!(a.bound.get("b").map(Vec::len), Some(1));
    assert!(s.log.lock().iter().any(|e| e.starts_with("bind:a:b:")));
    assert!(s.sink.of_kind(DiagnosticKind::Deadlock).is_empty());
}

#[test]
fn static_cycle_is_reported_once() {
    let s = setup();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    s.fw.system_context().add_framework_listener(move |e| {
        if e.kind == FrameworkEventKind::Error {
            seen.lock().push((e.message.clone(), e.bundle.as_ref().map(Bundle::id)));
        }
    });
    s.runtime.add_bundle_components(&s.bundle, cycle(&[], true, &s.log)).unwrap();

    for name in ["a", "b", "c"] {
        assert_eq!(s.runtime.state(name), Some(ComponentState::Unsatisfied), "component {name}");
    }
    let reported = s.sink.of_kind(DiagnosticKind::Deadlock);
    assert_eq!(reported.len(), 3);
    assert!(reported[0].message.starts_with("Component dependency cycle cannot be resolved"));

    // another event re-runs the analysis without repeating the report
    s.fw.context(&s.bundle)
        .register_service(&["test.Other"], plain(), PropertyMap::new())
        .unwrap();
    assert_eq!(s.sink.of_kind(DiagnosticKind::Deadlock).len(), 3);
    assert!(s.log.lock().is_empty());

    let errors = errors.lock();
    assert_eq!(errors.len(), 3);
    for name in ["a", "b", "c"] {
        assert!(
            errors.iter().any(|(message, bundle)| message
                .starts_with(&format!("component {name} cannot resolve dependency cycle"))
                && *bundle == Some(s.bundle.id())),
            "no framework error for {name}: {errors:?}"
        );
    }
}

#[test]
fn fully_dynamic_immediate_cycle_activates_everything() {
    let s = setup();
    s.runtime
        .add_bundle_components(&s.bundle, cycle(&["a", "b", "c"], true, &s.log))
        .unwrap();

    for (name, reference) in [("a", "b"), ("b", "c"), ("c", "a")] {
        let info = s.runtime.configuration(name).unwrap();
        assert_eq!(info.state, ComponentState::Active, "component {name}");
        assert_eq!(info.bound.get(reference).map(Vec::len), Some(1), "component {name}");
        assert_eq!(count(&s.log, &format!("activate:{name}")), 1);
    }
    assert!(s.sink.of_kind(DiagnosticKind::Deadlock).is_empty());
}

#[test]
fn fully_dynamic_delayed_cycle_activates_on_first_use() {
    let s = setup();
    s.runtime
        .add_bundle_components(&s.bundle, cycle(&["a", "b", "c"], false, &s.log))
        .unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(s.runtime.state(name), Some(ComponentState::Satisfied), "component {name}");
    }
    assert!(s.log.lock().is_empty());

    let consumer = s.fw.install("consumer");
    s.fw.start_bundle(&consumer).unwrap();
    let ctx = s.fw.context(&consumer);
    let a = ctx.find_reference("test.A").unwrap();
    let (tx, rx) = mpsc::channel();
    let (getter, reference) = (ctx.clone(), a.clone());
    std::thread::spawn(move || {
        let _ = tx.send(getter.get_service(&reference).is_some());
    });
    let got = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("getting the service of a delayed cycle must not hang");
    assert!(got);

    for (name, reference) in [("a", "b"), ("b", "c"), ("c", "a")] {
        let info = s.runtime.configuration(name).unwrap();
        assert_eq!(info.state, ComponentState::Active, "component {name}");
        assert_eq!(info.instances, 1, "component {name}");
        assert_eq!(info.bound.get(reference).map(Vec::len), Some(1), "component {name}");
        assert_eq!(count(&s.log, &format!("activate:{name}")), 1);
    }
    assert!(s.log.lock().iter().any(|e| *e == format!("bind:c:a:{}", a.id())));
    assert!(s.sink.of_kind(DiagnosticKind::ServiceFactory).is_empty());

    // the consumer and c share the single instance of a
    assert!(ctx.unget_service(&a, None));
    assert_eq!(s.runtime.state("a"), Some(ComponentState::Active));
    assert_eq!(count(&s.log, "deactivate:a"), 0);
}

#[test]
fn greedy_rebinds_and_reluctant_stays() {
    let s = setup();
    let greedy = ComponentMetadata::new("greedy").reference(
        ReferenceMetadata::new("x", "test.X")
            .cardinality(Cardinality::Optional)
            .dynamic()
            .greedy(),
    );
    let reluctant = ComponentMetadata::new("reluctant").reference(
        ReferenceMetadata::new("x", "test.X")
            .cardinality(Cardinality::Optional)
            .dynamic(),
    );
    s.runtime
        .add_bundle_components(&s.bundle, vec![recorded(greedy, &s.log), recorded(reluctant, &s.log)])
        .unwrap();
    assert_eq!(s.runtime.state("greedy"), Some(ComponentState::Active));

    let ctx = s.fw.context(&s.bundle);
    let low = ctx
        .register_service(&["test.X"], plain(), PropertyMap::new().with(SERVICE_RANKING, 1))
        .unwrap();
    let high = ctx
        .register_service(&["test.X"], plain(), PropertyMap::new().with(SERVICE_RANKING, 5))
        .unwrap();

    let bound = |name: &str| s.runtime.configuration(name).unwrap().bound.get("x").cloned().unwrap_or_default();
    assert_eq!(bound("greedy"), vec![high.id()]);
    assert_eq!(bound("reluctant"), vec![low.id()]);

    let log = s.log.lock();
    let bind_high = log.iter().position(|e| *e == format!("bind:greedy:x:{}", high.id())).unwrap();
    let unbind_low = log.iter().position(|e| *e == format!("unbind:greedy:x:{}", low.id())).unwrap();
    assert!(bind_high < unbind_low);
}

#[test]
fn multiple_reference_tracks_every_candidate() {
    let s = setup();
    let meta = ComponentMetadata::new("all").reference(
        ReferenceMetadata::new("x", "test.X")
            .cardinality(Cardinality::Multiple)
            .dynamic(),
    );
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(meta, &s.log)]).unwrap();

    let ctx = s.fw.context(&s.bundle);
    let one = ctx.register_service(&["test.X"], plain(), PropertyMap::new()).unwrap();
    let two = ctx.register_service(&["test.X"], plain(), PropertyMap::new()).unwrap();
    let info = s.runtime.configuration("all").unwrap();
    assert_eq!(info.bound.get("x"), Some(&vec![one.id(), two.id()]));

    one.unregister().unwrap();
    let info = s.runtime.configuration("all").unwrap();
    assert_eq!(info.bound.get("x"), Some(&vec![two.id()]));
    assert_eq!(info.state, ComponentState::Active);
}

#[test]
fn static_reference_loss_restarts_component() {
    let s = setup();
    let meta = ComponentMetadata::new("s").reference(ReferenceMetadata::new("x", "test.X"));
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(meta, &s.log)]).unwrap();

    let ctx = s.fw.context(&s.bundle);
    let first = ctx.register_service(&["test.X"], plain(), PropertyMap::new()).unwrap();
    let second = ctx.register_service(&["test.X"], plain(), PropertyMap::new()).unwrap();
    assert_eq!(count(&s.log, "activate:s"), 1);

    first.unregister().unwrap();
    assert_eq!(s.runtime.state("s"), Some(ComponentState::Active));
    assert_eq!(count(&s.log, "deactivate:s"), 1);
    assert_eq!(count(&s.log, "activate:s"), 2);
    let info = s.runtime.configuration("s").unwrap();
    assert_eq!(info.bound.get("x"), Some(&vec![second.id()]));
}

#[test]
fn own_service_is_never_bound() {
    let s = setup();
    let meta = ComponentMetadata::new("self")
        .provides(&["test.X"])
        .immediate(true)
        .reference(
            ReferenceMetadata::new("peers", "test.X")
                .cardinality(Cardinality::Multiple)
                .dynamic(),
        );
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(meta, &s.log)]).unwrap();
    assert_eq!(s.runtime.state("self"), Some(ComponentState::Active));
    let info = s.runtime.configuration("self").unwrap();
    assert_eq!(info.bound.get("peers"), Some(&Vec::new()));
}

#[test]
fn activation_failure_marks_component_failed() {
    let s = setup();
    let fail = Arc::new(AtomicBool::new(true));
    let flag = fail.clone();
    let log = s.log.clone();
    let description = ComponentDescription::new(
        ComponentMetadata::new("fragile").provides(&["test.F"]).immediate(true),
        move |ctx: &ComponentContext| -> anyhow::Result<Arc<dyn ComponentInstance>> {
            if flag.load(Ordering::SeqCst) {
                anyhow::bail!("not today");
            }
            Ok(Arc::new(Recorder {
                name: ctx.component_name().to_owned(),
                log: log.clone(),
                object: Some(object_for(&["test.F".to_owned()], "fragile")),
            }))
        },
    );
    s.runtime.add_bundle_components(&s.bundle, vec![description]).unwrap();

    assert_eq!(s.runtime.state("fragile"), Some(ComponentState::Failed));
    let info = s.runtime.configuration("fragile").unwrap();
    assert!(info.failure.unwrap().contains("not today"));
    let reported = s.sink.of_kind(DiagnosticKind::Component);
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].component.as_deref(), Some("fragile"));

    fail.store(false, Ordering::SeqCst);
    s.runtime.enable_component("fragile").unwrap();
    assert_eq!(s.runtime.state("fragile"), Some(ComponentState::Active));
    assert!(s.fw.context(&s.bundle).find_reference("test.F").is_some());
}

#[test]
fn disable_and_enable() {
    let s = setup();
    let meta = ComponentMetadata::new("toggle").provides(&["test.T"]).immediate(true);
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(meta, &s.log)]).unwrap();
    let ctx = s.fw.context(&s.bundle);
    assert!(ctx.find_reference("test.T").is_some());

    s.runtime.disable_component("toggle").unwrap();
    assert_eq!(s.runtime.state("toggle"), Some(ComponentState::Unsatisfied));
    assert!(ctx.find_reference("test.T").is_none());

    s.runtime.enable_component("toggle").unwrap();
    assert_eq!(s.runtime.state("toggle"), Some(ComponentState::Active));
    assert_eq!(*s.log.lock(), vec!["activate:toggle", "deactivate:toggle", "activate:toggle"]);

    match s.runtime.enable_component("missing") {
        Err(ComponentError::Unknown(name)) => assert_eq!(name, "missing"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn component_can_enable_a_sibling() {
    let s = setup();
    let later = ComponentMetadata::new("later").disabled();
    let log = s.log.clone();
    let starter = ComponentDescription::new(
        ComponentMetadata::new("starter"),
        move |_ctx: &ComponentContext| -> anyhow::Result<Arc<dyn ComponentInstance>> {
            Ok(Arc::new(Starter))
        },
    );
    s.runtime
        .add_bundle_components(&s.bundle, vec![recorded(later, &log), starter])
        .unwrap();
    assert_eq!(s.runtime.state("later"), Some(ComponentState::Active));
    assert_eq!(count(&s.log, "activate:later"), 1);
}

struct Starter;

impl ComponentInstance for Starter {
    fn activate(&self, ctx: &ComponentContext) -> anyhow::Result<()> {
        ctx.enable_component("later");
        Ok(())
    }
}

#[test]
fn duplicate_and_invalid_descriptions_are_rejected() {
    let s = setup();
    let first = ComponentMetadata::new("dup");
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(first.clone(), &s.log)]).unwrap();
    assert_eq!(
        s.runtime.add_bundle_components(&s.bundle, vec![recorded(first, &s.log)]),
        Err(ComponentError::Duplicate("dup".into()))
    );

    let bad = ComponentMetadata::new("bad").reference(ReferenceMetadata::new("x", "test.X").target("(broken"));
    match s.runtime.add_bundle_components(&s.bundle, vec![recorded(bad, &s.log)]) {
        Err(ComponentError::InvalidDescription { component, .. }) => assert_eq!(component, "bad"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(s.runtime.state("bad").is_none());
}

#[test]
fn target_filter_limits_candidates() {
    let s = setup();
    let meta = ComponentMetadata::new("picky")
        .reference(ReferenceMetadata::new("x", "test.X").target("(flavor=mint)"));
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(meta, &s.log)]).unwrap();

    let ctx = s.fw.context(&s.bundle);
    ctx.register_service(&["test.X"], plain(), PropertyMap::new().with("flavor", "lemon")).unwrap();
    assert_eq!(s.runtime.state("picky"), Some(ComponentState::Unsatisfied));
    ctx.register_service(&["test.X"], plain(), PropertyMap::new().with("flavor", "mint")).unwrap();
    assert_eq!(s.runtime.state("picky"), Some(ComponentState::Active));
}

#[test]
fn updated_properties_reach_the_published_service() {
    let s = setup();
    let meta = ComponentMetadata::new("conf")
        .provides(&["test.Conf"])
        .immediate(true)
        .property("mode", "slow");
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(meta, &s.log)]).unwrap();
    let ctx = s.fw.context(&s.bundle);
    let mode = || {
        ctx.find_reference("test.Conf")
            .and_then(|r| r.property("mode"))
            .and_then(|v| v.as_str().map(str::to_owned))
    };
    assert_eq!(mode().as_deref(), Some("slow"));

    s.runtime
        .update_properties("conf", PropertyMap::new().with("mode", "fast"))
        .unwrap();
    assert_eq!(mode().as_deref(), Some("fast"));
    // Recorder declines in-place updates, so the component restarted
    assert_eq!(count(&s.log, "activate:conf"), 2);
}

#[test]
fn stopping_the_bundle_removes_its_components() {
    let s = setup();
    let meta = ComponentMetadata::new("owned").provides(&["test.O"]).immediate(true);
    s.runtime.add_bundle_components(&s.bundle, vec![recorded(meta, &s.log)]).unwrap();
    assert_eq!(s.runtime.state("owned"), Some(ComponentState::Active));

    s.fw.stop_bundle(&s.bundle).unwrap();
    assert!(s.runtime.state("owned").is_none());
    assert_eq!(count(&s.log, "deactivate:owned"), 1);
}

#[test]
fn activation_order_follows_references() {
    let s = setup();
    let consumer = ComponentMetadata::new("consumer").reference(ReferenceMetadata::new("p", "test.P"));
    let provider = ComponentMetadata::new("provider").provides(&["test.P"]);
    s.runtime
        .add_bundle_components(&s.bundle, vec![recorded(consumer, &s.log), recorded(provider, &s.log)])
        .unwrap();
    let order = s.runtime.dependency_graph().activation_order().unwrap();
    assert_eq!(order, vec!["provider", "consumer"]);

    let names: Vec<String> = s.runtime.configurations().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["provider", "consumer"]);
    assert_eq!(s.runtime.state("consumer"), Some(ComponentState::Active));
}

struct Sulky {
    log: Log,
}

impl ComponentInstance for Sulky {
    fn activate(&self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        self.log.lock().push("activate:sulky".to_owned());
        Ok(())
    }

    fn deactivate(&self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        panic!("refusing to stop")
    }

    fn unbind(&self, reference: &str, _service: &BoundService) -> anyhow::Result<()> {
        anyhow::bail!("refusing to let go of {reference}")
    }

    fn service(&self) -> Option<ServiceObject> {
        Some(object_for(&["test.Sulky".to_owned()], "sulky"))
    }
}

#[test]
fn failing_teardown_callbacks_still_complete_deactivation() {
    let s = setup();
    let log = s.log.clone();
    let description = ComponentDescription::new(
        ComponentMetadata::new("sulky")
            .provides(&["test.Sulky"])
            .immediate(true)
            .reference(ReferenceMetadata::new("x", "test.X"))
            .reference(
                ReferenceMetadata::new("y", "test.Y")
                    .cardinality(Cardinality::Optional)
                    .dynamic(),
            ),
        move |_ctx: &ComponentContext| -> anyhow::Result<Arc<dyn ComponentInstance>> {
            Ok(Arc::new(Sulky { log: log.clone() }))
        },
    );
    s.runtime.add_bundle_components(&s.bundle, vec![description]).unwrap();

    let ctx = s.fw.context(&s.bundle);
    let y = ctx.register_service(&["test.Y"], plain(), PropertyMap::new()).unwrap();
    let x = ctx.register_service(&["test.X"], plain(), PropertyMap::new()).unwrap();
    assert_eq!(s.runtime.state("sulky"), Some(ComponentState::Active));
    assert_eq!(s.runtime.configuration("sulky").unwrap().bound.get("y"), Some(&vec![y.id()]));

    x.unregister().unwrap();
    assert_eq!(s.runtime.state("sulky"), Some(ComponentState::Unsatisfied));
    assert!(ctx.find_reference("test.Sulky").is_none());
    let info = s.runtime.configuration("sulky").unwrap();
    assert!(info.bound.is_empty());
    assert_eq!(info.instances, 0);
    assert!(!y.reference().using_bundles().contains(&s.bundle.id()));

    let warnings = s.sink.of_kind(DiagnosticKind::Component);
    assert_eq!(warnings.len(), 3);
    assert!(warnings.iter().all(|d| d.severity == Severity::Warning));
    assert!(warnings.iter().any(|d| d.cause.as_deref().unwrap_or("").contains("refusing to stop")));
    assert_eq!(
        warnings
            .iter()
            .filter(|d| d.cause.as_deref().unwrap_or("").contains("refusing to let go"))
            .count(),
        2
    );

    // a fresh provider brings the component back
    ctx.register_service(&["test.X"], plain(), PropertyMap::new()).unwrap();
    assert_eq!(s.runtime.state("sulky"), Some(ComponentState::Active));
    assert_eq!(count(&s.log, "activate:sulky"), 2);
}
