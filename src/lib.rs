use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};

use crate::{
    core::{
        backup::BackupWriter, scanner::ScannerActor, settings::Settings, sync::SyncEngine,
        transfer::ChunkAssembler,
    },
    integrations::connectivity::MonitorHandle,
};

pub mod core;
pub mod error;
pub mod integrations;
pub mod util;
pub mod web;

/// Return-to-sender handle attached to every actor request.
pub struct Rto<T> {
    tx: oneshot::Sender<anyhow::Result<T>>,
}

impl<T> Rto<T> {
    pub fn new(tx: oneshot::Sender<anyhow::Result<T>>) -> Self {
        Rto { tx }
    }

    pub fn reply(self, value: anyhow::Result<T>) {
        if self.tx.send(value).is_err() {
            log::debug!("Actor reply dropped, requester went away");
        }
    }
}

/// Sending half of an actor's mailbox.
pub struct ActorRef<T> {
    tx: UnboundedSender<T>,
}

impl<T> Clone for ActorRef<T> {
    fn clone(&self) -> Self {
        ActorRef {
            tx: self.tx.clone(),
        }
    }
}

impl<T> ActorRef<T> {
    pub fn new() -> (Self, UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ActorRef { tx }, rx)
    }

    pub fn send(&self, msg: T) -> anyhow::Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| anyhow!("Actor mailbox is closed"))
    }
}

/// Sends a request to an actor and waits for its reply.
///
/// `send_message!(actor, RequestEnum, Variant, args...)` builds
/// `RequestEnum::Variant(args..., rto)` and evaluates to the
/// `anyhow::Result` the actor replied with. Must be used in an async context.
#[macro_export]
macro_rules! send_message {
    ($actor:expr, $kind:ident, $variant:ident $(, $arg:expr)* $(,)?) => {{
        let (tx, rx) = tokio::sync::oneshot::channel();
        match $actor.send($kind::$variant($($arg,)* $crate::Rto::new(tx))) {
            Ok(()) => match rx.await {
                Ok(reply) => reply,
                Err(_) => Err(anyhow::anyhow!(
                    "{} actor stopped before replying",
                    stringify!($kind)
                )),
            },
            Err(e) => Err(e),
        }
    }};
}

/// Handles to every long-running component, shared with the web layer.
#[derive(Clone)]
pub struct Directory {
    pub scanner_actor: ScannerActor,
    pub sync_engine: Arc<SyncEngine>,
    pub monitor: MonitorHandle,
    pub assembler: Arc<ChunkAssembler>,
    pub backup: Arc<BackupWriter>,
    pub settings: Arc<Settings>,
}
