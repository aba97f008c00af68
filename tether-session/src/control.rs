//! Subscribe/unsubscribe control messages.
//!
//! Control frames bypass invocation entirely: they operate on the per-call
//! resource tables. Responses correlate by the control message's own id,
//! which is the call ID of the original action.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tether_wire::{Message, MessageType, SubscribeBody, codec};

use crate::dispatch::Dispatcher;
use crate::errors::DispatchError;
use crate::response::Response;
use crate::streams::{StreamSubscription, forwarding_observer};

impl Dispatcher {
    /// `ActionObservableSubscribe { id: subID }`: open one client
    /// subscription on a stream-result call.
    pub(crate) fn handle_subscribe(
        &self,
        message: &Message,
        _response: &Response,
    ) -> Result<(), DispatchError> {
        let body: SubscribeBody = codec::decode(&message.body)?;
        let sub_id = body.id;

        let mut tables = self.tables().lock().unwrap();
        let entry = tables
            .streams
            .get_mut(&message.id)
            .ok_or_else(|| DispatchError::Control("No observable found".into()))?;
        if entry.subscriptions.contains_key(&sub_id) {
            return Err(DispatchError::Control("Subscription already created".into()));
        }

        let active = Arc::new(AtomicBool::new(true));
        let observer = forwarding_observer(
            self.sink().clone(),
            message.id,
            sub_id,
            entry.item_schema.clone(),
            active.clone(),
            Arc::downgrade(self.tables()),
            self.expose_stack(),
        );
        // A latched subject replays its current value inside subscribe();
        // the item carries the new subscription's id.
        let guard = entry.source.subscribe(observer);
        entry.subscriptions.insert(sub_id, StreamSubscription { active, guard });
        debug!(call_id = message.id, sub_id, "stream subscription opened");
        Ok(())
    }

    /// `ActionObservableUnsubscribe { id: subID }`: tear down one client
    /// subscription. The `active` flag is cleared before the source-side
    /// cancel so a racing in-flight value cannot slip out.
    pub(crate) fn handle_unsubscribe(
        &self,
        message: &Message,
        _response: &Response,
    ) -> Result<(), DispatchError> {
        let body: SubscribeBody = codec::decode(&message.body)?;
        let sub_id = body.id;

        let mut tables = self.tables().lock().unwrap();
        let entry = tables
            .streams
            .get_mut(&message.id)
            .ok_or_else(|| DispatchError::Control("No observable found".into()))?;
        let subscription = entry
            .subscriptions
            .remove(&sub_id)
            .ok_or_else(|| DispatchError::Control("Subscription not found".into()))?;
        subscription.deactivate();
        drop(subscription); // cancels the source-side subscription
        debug!(call_id = message.id, sub_id, "stream subscription closed");
        Ok(())
    }

    /// `ActionObservableSubjectUnsubscribe`: cancel the server-held
    /// auto-subscription of a subject result.
    pub(crate) fn handle_subject_unsubscribe(
        &self,
        message: &Message,
        _response: &Response,
    ) -> Result<(), DispatchError> {
        let mut tables = self.tables().lock().unwrap();
        let entry = tables
            .streams
            .get_mut(&message.id)
            .ok_or_else(|| DispatchError::Control("No observable found".into()))?;
        if let Some(auto) = entry.auto.take() {
            auto.deactivate();
        }
        debug!(call_id = message.id, "subject auto-subscription cancelled");
        Ok(())
    }

    /// `ResponseActionCollectionUnsubscribe`: tear down a live collection
    /// result: drop pending batches, cancel the change feed, unsubscribe the
    /// underlying collection, and forget the entry.
    pub(crate) fn handle_collection_unsubscribe(
        &self,
        message: &Message,
        _response: &Response,
    ) -> Result<(), DispatchError> {
        let entry = {
            let mut tables = self.tables().lock().unwrap();
            tables
                .collections
                .remove(&message.id)
                .ok_or_else(|| DispatchError::Control("No collection found".into()))?
        };
        drop(entry); // runs the cancel closure
        debug!(call_id = message.id, "collection unsubscribed");
        Ok(())
    }

    pub(crate) fn handle_control(&self, message: &Message, response: &Response) {
        let outcome = match message.ty {
            MessageType::ActionObservableSubscribe => self.handle_subscribe(message, response),
            MessageType::ActionObservableUnsubscribe => self.handle_unsubscribe(message, response),
            MessageType::ActionObservableSubjectUnsubscribe => {
                self.handle_subject_unsubscribe(message, response)
            }
            MessageType::ResponseActionCollectionUnsubscribe => {
                self.handle_collection_unsubscribe(message, response)
            }
            other => Err(DispatchError::Control(format!(
                "unexpected control message type {other}"
            ))),
        };
        if let Err(err) = outcome {
            response.error(&err);
        }
    }
}
