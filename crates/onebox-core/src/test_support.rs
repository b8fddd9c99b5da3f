//! Scripted fakes shared by the unit tests

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use onebox_imap::{
    CancelToken, FetchedMessage, IdleEvent, ImapError, ImapResult, MailSession, MailboxStatus,
};

use crate::database::tests::sample_account;
use crate::{BackoffPolicy, Database, IngestSink, StoredMessage};

/// What the fake server does next
#[derive(Default)]
pub(crate) struct Script {
    /// Consumed per connect; an empty queue means success
    pub connect_results: VecDeque<ImapResult<()>>,
    /// Server-side folder contents by UID
    pub mailbox: BTreeMap<u32, FetchedMessage>,
    /// This UID fails once with a fetch error, ending the range
    pub fail_fetch_once: Option<u32>,
    /// Every fetch fails before yielding anything
    pub fail_fetch_always: bool,
    /// Consumed per wait; an empty queue blocks until cancelled
    pub idle_events: VecDeque<ImapResult<IdleEvent>>,
    pub connects: usize,
    pub disconnects: usize,
    pub fetch_calls: Vec<(u32, Option<u32>)>,
}

#[derive(Clone)]
pub(crate) struct ScriptedSession {
    script: Arc<Mutex<Script>>,
    connected: bool,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            connected: false,
        }
    }

    pub fn script(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap());
    }

    pub fn read<T>(&self, f: impl FnOnce(&Script) -> T) -> T {
        f(&self.script.lock().unwrap())
    }

    /// Put messages with these UIDs on the fake server
    pub fn deliver(&self, uids: impl IntoIterator<Item = u32>) {
        self.script(|s| {
            for uid in uids {
                s.mailbox.insert(uid, message(uid));
            }
        });
    }
}

#[async_trait]
impl MailSession for ScriptedSession {
    async fn connect(&mut self) -> ImapResult<()> {
        let result = {
            let mut script = self.script.lock().unwrap();
            script.connects += 1;
            script.connect_results.pop_front().unwrap_or(Ok(()))
        };
        self.connected = result.is_ok();
        result
    }

    async fn select_folder(&mut self, folder: &str) -> ImapResult<MailboxStatus> {
        if !self.connected {
            return Err(ImapError::NotConnected);
        }
        let script = self.script.lock().unwrap();
        Ok(MailboxStatus {
            name: folder.to_string(),
            exists: script.mailbox.len() as u32,
            uid_next: script.mailbox.keys().last().map(|uid| uid + 1),
            uid_validity: Some(1),
        })
    }

    async fn fetch_range<'a>(
        &'a mut self,
        _folder: &str,
        from_uid: u32,
        to_uid: Option<u32>,
    ) -> ImapResult<BoxStream<'a, ImapResult<FetchedMessage>>> {
        if !self.connected {
            return Err(ImapError::NotConnected);
        }

        let mut script = self.script.lock().unwrap();
        script.fetch_calls.push((from_uid, to_uid));
        if script.fail_fetch_always {
            return Err(ImapError::ConnectionLost("reset by peer".to_string()));
        }

        let fail_at = script.fail_fetch_once;
        let mut items = Vec::new();
        for (uid, message) in script.mailbox.range(from_uid..) {
            if to_uid.is_some_and(|to| *uid > to) {
                break;
            }
            if fail_at == Some(*uid) {
                items.push(Err(ImapError::FetchFailed {
                    uid: Some(*uid),
                    reason: "connection reset".to_string(),
                }));
                break;
            }
            items.push(Ok(message.clone()));
        }
        if items.iter().any(Result::is_err) {
            script.fail_fetch_once = None;
        }

        Ok(stream::iter(items).boxed())
    }

    async fn wait_for_change(
        &mut self,
        _folder: &str,
        cancel: &mut CancelToken,
    ) -> ImapResult<IdleEvent> {
        if !self.connected {
            return Err(ImapError::NotConnected);
        }

        let next = self.script.lock().unwrap().idle_events.pop_front();
        match next {
            Some(result) => result,
            None => {
                cancel.cancelled().await;
                Ok(IdleEvent::Cancelled)
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.script.lock().unwrap().disconnects += 1;
        }
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Records every message handed to it
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub received: Mutex<Vec<StoredMessage>>,
}

impl RecordingSink {
    pub fn uids(&self) -> Vec<u32> {
        self.received.lock().unwrap().iter().map(|m| m.uid).collect()
    }
}

#[async_trait]
impl IngestSink for RecordingSink {
    async fn on_message_ingested(&self, message: StoredMessage) {
        self.received.lock().unwrap().push(message);
    }
}

pub(crate) fn message(uid: u32) -> FetchedMessage {
    FetchedMessage {
        uid,
        message_id: Some(format!("<{}@example.com>", uid)),
        subject: Some(format!("Message {}", uid)),
        date: Some(1_700_000_000 + i64::from(uid)),
        body_text: Some(format!("Body of message {}", uid)),
        ..FetchedMessage::default()
    }
}

pub(crate) fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(4),
        max_attempts: 5,
    }
}

pub(crate) async fn setup_account() -> (Arc<Database>, i64) {
    let db = Database::open_memory().await.unwrap();
    let account = db.create_account(&sample_account()).await.unwrap();
    (Arc::new(db), account.id)
}
