//! Scripted in-memory provider for tests.

use std::cell::RefCell;
use std::collections::VecDeque;

use super::{InstanceSnapshot, LaunchSpec, Offer, OfferQuery, Provider, ProviderKind};
use crate::error::PodliftError;

/// One scripted answer to `show_instance`.
pub enum Reply {
    Snapshot(Option<InstanceSnapshot>),
    Error(String),
}

#[derive(Default)]
pub struct FakeProvider {
    pub offers: Vec<Offer>,
    pub created_id: String,
    /// Answers popped per `show_instance` call; the last one repeats.
    pub replies: RefCell<VecDeque<Reply>>,
    pub logs: Option<String>,
    pub fail_destroy: bool,
    pub create_calls: RefCell<Vec<(Offer, LaunchSpec)>>,
    pub show_calls: RefCell<u32>,
    pub destroyed: RefCell<Vec<String>>,
    pub registered_keys: RefCell<Vec<String>>,
}

impl FakeProvider {
    pub fn with_offers(offers: Vec<Offer>) -> Self {
        Self {
            offers,
            created_id: "1001".into(),
            ..Default::default()
        }
    }

    pub fn with_replies(replies: Vec<Reply>) -> Self {
        Self {
            created_id: "1001".into(),
            replies: RefCell::new(replies.into()),
            ..Default::default()
        }
    }

    pub fn show_count(&self) -> u32 {
        *self.show_calls.borrow()
    }
}

pub fn offer(id: &str, gpu: &str, price: f64) -> Offer {
    Offer {
        id: id.into(),
        gpu_name: gpu.into(),
        gpu_count: 1,
        price_per_hour: price,
        disk_gb: 100.0,
        location: None,
    }
}

impl Provider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vast
    }

    async fn search_offers(&self, _query: &OfferQuery) -> Result<Vec<Offer>, PodliftError> {
        Ok(self.offers.clone())
    }

    async fn create_instance(
        &self,
        offer: &Offer,
        spec: &LaunchSpec,
    ) -> Result<String, PodliftError> {
        self.create_calls
            .borrow_mut()
            .push((offer.clone(), spec.clone()));
        Ok(self.created_id.clone())
    }

    async fn show_instance(&self, _id: &str) -> Result<Option<InstanceSnapshot>, PodliftError> {
        *self.show_calls.borrow_mut() += 1;
        let mut replies = self.replies.borrow_mut();
        let reply = if replies.len() > 1 {
            replies.pop_front()
        } else {
            None
        };
        let reply = reply.as_ref().or_else(|| replies.front());
        match reply {
            Some(Reply::Snapshot(snapshot)) => Ok(snapshot.clone()),
            Some(Reply::Error(message)) => Err(self.kind().error(message.clone())),
            None => Ok(None),
        }
    }

    async fn instance_logs(&self, id: &str) -> Result<String, PodliftError> {
        self.logs
            .clone()
            .ok_or_else(|| self.kind().error(format!("no logs for {id}")))
    }

    async fn destroy_instance(&self, id: &str) -> Result<(), PodliftError> {
        if self.fail_destroy {
            return Err(self.kind().error("destroy refused"));
        }
        self.destroyed.borrow_mut().push(id.to_string());
        Ok(())
    }

    async fn register_ssh_key(&self, public_key: &str) -> Result<(), PodliftError> {
        self.registered_keys.borrow_mut().push(public_key.to_string());
        Ok(())
    }
}
