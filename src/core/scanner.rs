use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{ActorRef, Rto};

use super::{
    admission::{AdmissionEngine, ScanOutcome, ScanSession, TeamProgress},
    event::{AdmissionMode, EventCatalog, EventContext},
    participant::ParticipantRecord,
    registration::{Registrar, RegistrationRequest},
};

#[derive(Deserialize, Debug, Clone)]
pub struct OpenSession {
    pub event_id: String,
    #[serde(flatten)]
    pub mode: AdmissionMode,
}

#[derive(Serialize, Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub event: EventContext,
    pub mode: AdmissionMode,
    pub members: Vec<String>,
    pub awaiting_decision: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamProgress>,
}

impl SessionInfo {
    fn new(id: u64, session: &ScanSession) -> Self {
        SessionInfo {
            id,
            event: session.event().clone(),
            mode: session.mode().clone(),
            members: session.members().to_vec(),
            awaiting_decision: session.is_awaiting_decision(),
            team: session.team_progress(),
        }
    }
}

pub enum ScannerRequest {
    Open(OpenSession, Rto<SessionInfo>),
    Scan(u64, String, Rto<ScanOutcome>),
    Confirm(u64, Rto<ScanOutcome>),
    Cancel(u64, Rto<()>),
    Register(u64, RegistrationRequest, Rto<ParticipantRecord>),
    Get(u64, Rto<SessionInfo>),
    Close(u64, Rto<SessionInfo>),
}

pub type ScannerActor = ActorRef<ScannerRequest>;

/// Owns every open scan session. Requests for a session are handled in
/// arrival order.
pub async fn run_scanner_actor(
    engine: Arc<AdmissionEngine>,
    registrar: Arc<Registrar>,
    catalog: EventCatalog,
    mut rx: UnboundedReceiver<ScannerRequest>,
) -> anyhow::Result<()> {
    let mut sessions: HashMap<u64, ScanSession> = HashMap::new();
    let mut next_id: u64 = 1;

    while let Some(msg) = rx.recv().await {
        match msg {
            ScannerRequest::Open(open, rto) => {
                if open.event_id.trim().is_empty() {
                    rto.reply(Err(anyhow!("An event is required to open a scan session")));
                    continue;
                }
                if let AdmissionMode::Team { team_name, size } = &open.mode {
                    if team_name.trim().is_empty() || *size == 0 {
                        rto.reply(Err(anyhow!("Team sessions need a name and a size")));
                        continue;
                    }
                }

                let session = ScanSession::new(catalog.context(&open.event_id), open.mode);
                let id = next_id;
                next_id += 1;
                log::info!(
                    "Opened scan session {} for {} ({:?})",
                    id,
                    session.event().event_id,
                    session.mode()
                );
                rto.reply(Ok(SessionInfo::new(id, &session)));
                sessions.insert(id, session);
            }
            ScannerRequest::Scan(id, token, rto) => match sessions.get_mut(&id) {
                Some(session) => {
                    let outcome = engine.scan(session, &token).await;
                    if let Err(e) = &outcome {
                        log::error!("Scan in session {} failed: {}", id, e);
                    }
                    rto.reply(outcome.map_err(anyhow::Error::from));
                }
                None => rto.reply(Err(anyhow!("Scan session {} not found", id))),
            },
            ScannerRequest::Confirm(id, rto) => match sessions.get_mut(&id) {
                Some(session) => rto.reply(
                    engine
                        .confirm(session)
                        .await
                        .map_err(anyhow::Error::from),
                ),
                None => rto.reply(Err(anyhow!("Scan session {} not found", id))),
            },
            ScannerRequest::Cancel(id, rto) => match sessions.get_mut(&id) {
                Some(session) => rto.reply(engine.cancel(session).map_err(anyhow::Error::from)),
                None => rto.reply(Err(anyhow!("Scan session {} not found", id))),
            },
            ScannerRequest::Register(id, mut req, rto) => match sessions.get_mut(&id) {
                Some(session) => {
                    if req.admit {
                        if let Some(team) = session.team_progress().filter(|t| t.is_complete()) {
                            rto.reply(Err(anyhow!("Team {} is already complete", team.team_name)));
                            continue;
                        }
                    }
                    if req.team_name.is_none() {
                        req.team_name = session.mode().team_name().map(str::to_string);
                    }

                    let admit = req.admit;
                    let scanned_id = req.participant_id.clone();
                    let res = registrar.register(session.event(), req).await;
                    if let (true, Ok(record)) = (admit, &res) {
                        let scanned_id = scanned_id
                            .as_deref()
                            .filter(|id| !id.trim().is_empty())
                            .unwrap_or(record.participant_id.as_str());
                        session.record_admission(scanned_id, &record.participant_id);
                    }
                    rto.reply(res.map_err(anyhow::Error::from))
                }
                None => rto.reply(Err(anyhow!("Scan session {} not found", id))),
            },
            ScannerRequest::Get(id, rto) => match sessions.get(&id) {
                Some(session) => rto.reply(Ok(SessionInfo::new(id, session))),
                None => rto.reply(Err(anyhow!("Scan session {} not found", id))),
            },
            ScannerRequest::Close(id, rto) => match sessions.remove(&id) {
                Some(session) => {
                    log::info!(
                        "Closed scan session {} after {} admissions",
                        id,
                        session.members().len()
                    );
                    rto.reply(Ok(SessionInfo::new(id, &session)))
                }
                None => rto.reply(Err(anyhow!("Scan session {} not found", id))),
            },
        }
    }

    Ok(())
}
