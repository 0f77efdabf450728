//! End-to-end flows across the propagation and scoping APIs together, the
//! way an instrumented client and server would use them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use b3_propagation::current::{ContextSlot, ThreadLocalCurrentTraceContext};
use b3_propagation::propagation::{MapGetter, MapSetter};
use b3_propagation::{
    B3Propagation, CurrentTraceContext, CurrentTraceContextExt, Extraction, Format, Kind,
    RemoteSetter, Setter, StrictScopeDecorator, TraceContext,
};

thread_local! {
    static SLOT: ContextSlot = const { RefCell::new(None) };
}

fn isolated_current() -> ThreadLocalCurrentTraceContext {
    ThreadLocalCurrentTraceContext::builder()
        .slot(&SLOT)
        .build()
}

#[test]
fn client_to_server_round_trip() {
    let client_context = TraceContext::builder()
        .trace_id_high(0x1234)
        .trace_id(0x5678)
        .span_id(0x9abc)
        .sampled(true)
        .build()
        .unwrap();

    // client side: inject onto outgoing headers
    let mut headers = HashMap::new();
    B3Propagation::get()
        .injector(MapSetter)
        .inject(&client_context, &mut headers);

    // server side: extract, continue the trace in a child span
    let extraction = B3Propagation::get().extractor(MapGetter).extract(&headers);
    let server_context = extraction.context().expect("identifiers on the wire");
    assert_eq!(*server_context, client_context);
    assert_eq!(server_context.sampled(), Some(true));

    let child = server_context.new_child(0xdef0).unwrap();
    assert_eq!(child.trace_id_high(), 0x1234);
    assert_eq!(child.parent_id(), Some(0x9abc));

    let current = isolated_current();
    let _scope = current.new_scope(Some(child.clone()));
    assert_eq!(current.get(), Some(child));
}

#[test]
fn messaging_round_trip_uses_single_header() {
    struct ProducerSetter;
    impl Setter<HashMap<String, String>> for ProducerSetter {
        fn put(&self, carrier: &mut HashMap<String, String>, key: &str, value: String) {
            carrier.insert(key.to_string(), value);
        }
    }
    impl RemoteSetter for ProducerSetter {
        fn kind(&self) -> Kind {
            Kind::Producer
        }
    }

    let context = TraceContext::builder()
        .trace_id(10)
        .parent_id(11)
        .span_id(12)
        .sampled(true)
        .build()
        .unwrap();

    let mut properties = HashMap::new();
    B3Propagation::get()
        .remote_injector(ProducerSetter)
        .inject(&context, &mut properties);

    // compact form only, and no parent for messaging
    assert_eq!(properties.len(), 1);
    assert_eq!(properties["b3"], "000000000000000a-000000000000000c-1");

    let extraction = B3Propagation::get()
        .extractor(MapGetter)
        .extract(&properties);
    let consumed = extraction.context().unwrap();
    assert_eq!(*consumed, context);
    assert_eq!(consumed.parent_id(), None);
    assert_eq!(consumed.sampled(), Some(true));
}

#[test]
fn vec_carrier_with_closures() {
    type Headers = Vec<(String, String)>;

    fn get<'a>(carrier: &'a Headers, key: &str) -> Option<&'a str> {
        carrier
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    let propagation = B3Propagation::builder()
        .inject_format(Format::Single)
        .build()
        .unwrap();

    let context = TraceContext::builder()
        .trace_id(1)
        .parent_id(2)
        .span_id(3)
        .build()
        .unwrap();

    let mut headers: Headers = Vec::new();
    let setter = |carrier: &mut Headers, key: &str, value: String| {
        carrier.push((key.to_string(), value));
    };
    propagation.injector(setter).inject(&context, &mut headers);

    assert_eq!(headers.len(), 1);
    let extracted = propagation.extractor(get).extract(&headers);
    assert_eq!(extracted.context(), Some(&context));
    assert_eq!(extracted.context().unwrap().parent_id(), Some(2));
}

#[test]
fn flags_only_carrier_defers_to_local_decision() {
    let mut headers = HashMap::new();
    MapSetter.put(&mut headers, "X-B3-Sampled", "0".to_string());

    let extraction = B3Propagation::get().extractor(MapGetter).extract(&headers);
    assert!(extraction.context().is_none());
    assert_eq!(extraction.sampled(), Some(false));
    assert!(!extraction.is_empty());
}

#[test]
fn empty_carrier_extracts_empty() {
    let headers: HashMap<String, String> = HashMap::new();
    let extraction = B3Propagation::get().extractor(MapGetter).extract(&headers);
    assert_eq!(extraction, Extraction::EMPTY);
}

#[test]
fn wrapped_task_continues_trace_on_worker_thread() {
    thread_local! {
        static WORKER_SLOT: ContextSlot = const { RefCell::new(None) };
    }
    let decorator = StrictScopeDecorator::new();
    let current: Arc<dyn CurrentTraceContext> = Arc::new(
        ThreadLocalCurrentTraceContext::builder()
            .slot(&WORKER_SLOT)
            .add_scope_decorator(decorator.clone())
            .build(),
    );

    let context = TraceContext::builder()
        .trace_id(1)
        .span_id(2)
        .build()
        .unwrap();

    let task = {
        let _scope = current.new_scope(Some(context.clone()));
        let observer = Arc::clone(&current);
        current.wrap(move || {
            // inject from the re-established context on the worker
            let seen = observer.get().expect("context follows the task");
            let mut headers = HashMap::new();
            B3Propagation::get()
                .injector(MapSetter)
                .inject(&seen, &mut headers);
            headers
        })
    };

    let headers = std::thread::spawn(task).join().unwrap();
    assert_eq!(headers["X-B3-TraceId"], "0000000000000001");
    assert_eq!(headers["X-B3-SpanId"], "0000000000000002");

    // every scope, including the task's, was closed on its own thread
    decorator.close();
}
