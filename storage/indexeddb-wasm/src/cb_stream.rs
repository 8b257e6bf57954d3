use std::cell::RefCell;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::stream::Stream;
use wasm_bindgen::prelude::*;
use web_sys::{Event, EventTarget};

/// A stream of request results for events that fire repeatedly, e.g. the
/// per-record "success" of an IndexedDB cursor request.
pub struct CbStream {
    receiver: mpsc::UnboundedReceiver<Result<JsValue, Event>>,
    _callbacks: Vec<(Closure<dyn FnMut(Event)>, EventTarget)>,
}

impl CbStream {
    pub fn new<T: AsRef<EventTarget>>(target: &T, success_event: &str, error_event: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded();
        let mut callbacks = Vec::new();
        let target = target.as_ref();

        let sender = Rc::new(RefCell::new(sender));

        let success_callback = Closure::wrap(Box::new({
            let sender = sender.clone();
            move |event: Event| {
                if let Some(target) = event.target() {
                    let request: web_sys::IdbRequest = target.unchecked_into();
                    if let Ok(result) = request.result() {
                        let _ = sender.borrow().unbounded_send(Ok(result));
                    }
                }
            }
        }) as Box<dyn FnMut(_)>);

        let error_callback = Closure::wrap(Box::new({
            move |event: Event| {
                let _ = sender.borrow().unbounded_send(Err(event));
            }
        }) as Box<dyn FnMut(_)>);

        target.add_event_listener_with_callback(success_event, success_callback.as_ref().unchecked_ref()).expect("add success listener");
        target.add_event_listener_with_callback(error_event, error_callback.as_ref().unchecked_ref()).expect("add error listener");

        callbacks.push((success_callback, target.clone()));
        callbacks.push((error_callback, target.clone()));

        Self { receiver, _callbacks: callbacks }
    }
}

impl Stream for CbStream {
    type Item = Result<JsValue, Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}
