use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::FutureExt;
use wasm_bindgen::prelude::*;
use web_sys::{Event, EventTarget};

/// A future that resolves when one of the given events fires on the target.
pub struct CbFuture {
    receiver: oneshot::Receiver<Result<(), Event>>,
    _callbacks: Vec<(Closure<dyn FnMut(Event)>, EventTarget)>, // keep target alive with the closures
}

impl CbFuture {
    pub fn new<T: AsRef<EventTarget>>(target: &T, success_events: &[&str], error_event: &str) -> Self {
        let (sender, receiver) = oneshot::channel();
        let mut callbacks = Vec::new();
        let target = target.as_ref();

        let sender = Rc::new(RefCell::new(Some(sender)));

        let success_callback = Closure::wrap(Box::new({
            let sender = sender.clone();
            move |_event: Event| {
                if let Some(sender) = sender.borrow_mut().take() {
                    let _ = sender.send(Ok(()));
                }
            }
        }) as Box<dyn FnMut(_)>);
        for success_event in success_events {
            target
                .add_event_listener_with_callback(success_event, success_callback.as_ref().unchecked_ref())
                .expect("add success listener");
        }

        let error_callback = Closure::wrap(Box::new({
            move |event: Event| {
                if let Some(sender) = sender.borrow_mut().take() {
                    let _ = sender.send(Err(event));
                }
            }
        }) as Box<dyn FnMut(_)>);
        target
            .add_event_listener_with_callback(error_event, error_callback.as_ref().unchecked_ref())
            .expect("add error listener");

        callbacks.push((success_callback, target.clone()));
        callbacks.push((error_callback, target.clone()));

        Self { receiver, _callbacks: callbacks }
    }
}

impl Future for CbFuture {
    type Output = Result<(), Event>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The sender lives in the registered callbacks, so the channel cannot
        // drop before firing.
        self.receiver.poll_unpin(cx).map(|r| r.expect("event callback dropped"))
    }
}
