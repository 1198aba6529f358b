//! Conversation threading.
//!
//! Resolution is split in two: [`plan`] is a pure function from a candidate
//! message and the already-known messages around it to a thread id and the
//! merges it implies, and [`ThreadResolver`] gathers that context from the
//! store and persists the outcome in one transaction.
//!
//! Rules, first match wins:
//! 1. provider thread id (when enabled)
//! 2. thread of a known message named in the references, earliest reference first
//! 3. thread of a duplicate delivery (same message id and content hash)
//! 4. the first reference itself, unless it is the message's own id
//! 5. `{hash}:{uid}`

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::Result;
use crate::config::ThreadingConfig;
use crate::model::{
    AccountId, FetchedMessage, FolderId, MessageId, NewMessage, ThreadInfo, ThreadMerge,
    normalize_references, normalize_subject,
};
use crate::store::Store;

/// A message about to be threaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadCandidate {
    /// Owning account.
    pub account: AccountId,
    /// Folder holding the message.
    pub folder: FolderId,
    /// Server UID.
    pub uid: u32,
    /// Message id, synthesized when the header is missing.
    pub msgid: String,
    /// Normalized references, in-reply-to included.
    pub references: Vec<String>,
    /// `In-Reply-To`.
    pub in_reply_to: Option<String>,
    /// Provider thread id.
    pub native_thread_id: Option<String>,
    /// Content hash.
    pub hash: String,
    /// Sender address.
    pub sender: Option<String>,
    /// Subject.
    pub subject: Option<String>,
    /// Server receive time.
    pub received: DateTime<Utc>,
}

impl ThreadCandidate {
    /// Build a candidate from fetched headers.
    #[must_use]
    pub fn from_fetched(account: AccountId, folder: FolderId, message: &FetchedMessage) -> Self {
        Self {
            account,
            folder,
            uid: message.uid,
            msgid: message.effective_msgid(),
            references: normalize_references(&message.references, message.in_reply_to.as_deref()),
            in_reply_to: message.in_reply_to.clone(),
            native_thread_id: message.native_thread_id.clone(),
            hash: message.content_hash(),
            sender: message.from.clone(),
            subject: message.subject.clone(),
            received: message.received,
        }
    }

    /// Thread id used when nothing relates this message to others.
    #[must_use]
    pub fn fallback_thread(&self) -> String {
        synthesized_thread(&self.hash, self.uid)
    }

    /// The row to store once the thread is known.
    #[must_use]
    pub fn into_message(self, thread: String) -> NewMessage {
        NewMessage {
            account: self.account,
            folder: self.folder,
            uid: self.uid,
            msgid: self.msgid,
            references: self.references,
            in_reply_to: self.in_reply_to,
            hash: self.hash,
            thread,
            sender: self.sender,
            subject: self.subject,
            received: self.received,
        }
    }

    fn is_self(&self, message: &ThreadInfo) -> bool {
        message.folder == self.folder && message.uid == self.uid
    }
}

fn synthesized_thread(hash: &str, uid: u32) -> String {
    format!("{hash}:{uid}")
}

/// Which rule produced a thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSource {
    /// Provider thread id.
    Native,
    /// A known referenced message.
    Reference,
    /// A duplicate delivery.
    Duplicate,
    /// The first reference, adopted as-is.
    FirstReference,
    /// Same sender and subject.
    Subject,
    /// Synthesized from hash and UID.
    Fallback,
}

/// Outcome of thread resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadResolution {
    /// Resolved thread id.
    pub thread: String,
    /// Rule that produced it.
    pub source: ThreadSource,
    /// Thread rewrites implied by this message.
    pub merges: Vec<ThreadMerge>,
}

/// Known messages around a candidate.
#[derive(Debug, Clone, Default)]
pub struct ThreadContext {
    /// Messages whose id is the candidate's own id or one of its references.
    pub related: Vec<ThreadInfo>,
    /// Messages referencing the candidate.
    pub referencing: Vec<ThreadInfo>,
    /// Same sender, same normalized subject, within the configured window.
    pub subject: Vec<ThreadInfo>,
}

/// Resolve a thread id without touching the store.
#[must_use]
pub fn plan(
    candidate: &ThreadCandidate,
    context: &ThreadContext,
    config: &ThreadingConfig,
) -> ThreadResolution {
    if config.native_thread_ids
        && let Some(native) = &candidate.native_thread_id
    {
        return ThreadResolution {
            thread: native.clone(),
            source: ThreadSource::Native,
            merges: Vec::new(),
        };
    }

    let mut related = known(candidate, &context.related);
    related.retain(|m| !m.thread.is_empty());
    let referencing = known(candidate, &context.referencing);

    let (mut thread, mut source) = by_relation(candidate, &related);

    let mut merges = Vec::new();
    if source == ThreadSource::Fallback && config.subject_threading {
        let window = Duration::hours(i64::from(config.subject_max_age));
        let matches = known(candidate, &context.subject);
        if let Some(newest) = matches.iter().max_by_key(|m| (m.received, m.id)) {
            thread.clone_from(&newest.thread);
            source = ThreadSource::Subject;
            for other in &matches {
                if other.thread != thread && other.thread == synthesized_thread(&other.hash, other.uid)
                {
                    push_merge(&mut merges, &other.thread, &thread, Some(candidate.received - window));
                }
            }
        }
    }

    let referenced = related
        .iter()
        .filter(|m| m.msgid != candidate.msgid && candidate.references.contains(&m.msgid));
    for message in referenced.chain(&referencing) {
        if message.thread != thread {
            push_merge(&mut merges, &message.thread, &thread, None);
        }
    }

    ThreadResolution {
        thread,
        source,
        merges,
    }
}

fn known<'a>(candidate: &ThreadCandidate, messages: &'a [ThreadInfo]) -> Vec<&'a ThreadInfo> {
    let mut known: Vec<_> = messages.iter().filter(|m| !candidate.is_self(m)).collect();
    known.sort_by_key(|m| m.id);
    known
}

fn by_relation(candidate: &ThreadCandidate, related: &[&ThreadInfo]) -> (String, ThreadSource) {
    for reference in &candidate.references {
        if let Some(message) = related.iter().find(|m| &m.msgid == reference) {
            return (message.thread.clone(), ThreadSource::Reference);
        }
    }

    if let Some(duplicate) = related
        .iter()
        .find(|m| m.msgid == candidate.msgid && m.hash == candidate.hash)
    {
        return (duplicate.thread.clone(), ThreadSource::Duplicate);
    }

    match candidate.references.first() {
        Some(first) if *first != candidate.msgid => (first.clone(), ThreadSource::FirstReference),
        _ => (candidate.fallback_thread(), ThreadSource::Fallback),
    }
}

fn push_merge(merges: &mut Vec<ThreadMerge>, from: &str, to: &str, since: Option<DateTime<Utc>>) {
    if !merges.iter().any(|m| m.from == from) {
        merges.push(ThreadMerge {
            from: from.to_string(),
            to: to.to_string(),
            since,
        });
    }
}

/// Resolves and persists thread ids for one account.
///
/// Resolution and storing run under a per-resolver lock so the lookups and
/// the merges they imply cannot interleave with another message of the same
/// account.
pub struct ThreadResolver {
    store: Arc<dyn Store>,
    config: ThreadingConfig,
    lock: Mutex<()>,
}

impl ThreadResolver {
    /// Create a resolver.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ThreadingConfig) -> Self {
        Self {
            store,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Resolve a candidate against the stored messages.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup fails.
    pub async fn resolve(&self, candidate: &ThreadCandidate) -> Result<ThreadResolution> {
        let mut context = ThreadContext::default();
        if !(self.config.native_thread_ids && candidate.native_thread_id.is_some()) {
            let mut ids = candidate.references.clone();
            ids.push(candidate.msgid.clone());
            context.related = self
                .store
                .messages_by_msgid(candidate.account, &ids)
                .await?;
            context.referencing = self
                .store
                .messages_referencing(candidate.account, &candidate.msgid)
                .await?;
        }

        let resolution = plan(candidate, &context, &self.config);
        if resolution.source != ThreadSource::Fallback || !self.config.subject_threading {
            return Ok(resolution);
        }
        let (Some(sender), Some(subject)) = (&candidate.sender, &candidate.subject) else {
            return Ok(resolution);
        };

        let since = candidate.received - Duration::hours(i64::from(self.config.subject_max_age));
        context.subject = self
            .store
            .messages_by_subject(candidate.account, sender, &normalize_subject(subject), since)
            .await?;
        Ok(plan(candidate, &context, &self.config))
    }

    /// Thread a fetched message and store it together with its merges.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup or the insert fails.
    pub async fn store(
        &self,
        account: AccountId,
        folder: FolderId,
        message: &FetchedMessage,
    ) -> Result<MessageId> {
        let _guard = self.lock.lock().await;
        let candidate = ThreadCandidate::from_fetched(account, folder, message);
        let resolution = self.resolve(&candidate).await?;
        debug!(
            uid = candidate.uid,
            thread = %resolution.thread,
            source = ?resolution.source,
            merges = resolution.merges.len(),
            "Message threaded"
        );
        self.store
            .store_message(&candidate.into_message(resolution.thread), &resolution.merges)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{AccountState, FolderState, ImapConfig};
    use crate::store::MemoryStore;

    const ACCOUNT: AccountId = AccountId(1);
    const FOLDER: FolderId = FolderId(1);

    fn candidate(uid: u32, msgid: &str, refs: &[&str]) -> ThreadCandidate {
        ThreadCandidate {
            account: ACCOUNT,
            folder: FOLDER,
            uid,
            msgid: msgid.into(),
            references: refs.iter().map(|r| (*r).to_string()).collect(),
            in_reply_to: None,
            native_thread_id: None,
            hash: format!("hash{uid}"),
            sender: Some("bob@example.com".into()),
            subject: Some("Plans".into()),
            received: Utc::now(),
        }
    }

    fn info(id: i64, uid: u32, msgid: &str, thread: &str) -> ThreadInfo {
        ThreadInfo {
            id: MessageId(id),
            account: ACCOUNT,
            folder: FOLDER,
            uid,
            msgid: msgid.into(),
            references: Vec::new(),
            in_reply_to: None,
            hash: format!("hash{uid}"),
            thread: thread.into(),
            sender: Some("bob@example.com".into()),
            subject: Some("Plans".into()),
            received: Utc::now(),
        }
    }

    fn fetched(uid: u32, msgid: &str, refs: &[&str], in_reply_to: Option<&str>) -> FetchedMessage {
        FetchedMessage {
            uid,
            msgid: Some(msgid.into()),
            references: refs.iter().map(|r| (*r).to_string()).collect(),
            in_reply_to: in_reply_to.map(str::to_string),
            native_thread_id: None,
            from: Some("bob@example.com".into()),
            subject: Some("Plans".into()),
            received: Utc::now(),
            headers: format!("Message-ID: {msgid}\r\n"),
        }
    }

    mod plan_tests {
        use super::*;

        #[test]
        fn native_id_short_circuits() {
            let mut c = candidate(1, "<m>", &["<a>"]);
            c.native_thread_id = Some("gmail:77".into());
            let context = ThreadContext {
                related: vec![info(1, 9, "<a>", "t-a")],
                ..ThreadContext::default()
            };

            let resolution = plan(&c, &context, &ThreadingConfig::default());
            assert_eq!(resolution.thread, "gmail:77");
            assert_eq!(resolution.source, ThreadSource::Native);
            assert!(resolution.merges.is_empty());
        }

        #[test]
        fn native_id_ignored_when_disabled() {
            let mut c = candidate(1, "<m>", &[]);
            c.native_thread_id = Some("gmail:77".into());
            let config = ThreadingConfig {
                native_thread_ids: false,
                ..ThreadingConfig::default()
            };

            let resolution = plan(&c, &ThreadContext::default(), &config);
            assert_eq!(resolution.source, ThreadSource::Fallback);
            assert_eq!(resolution.thread, "hash1:1");
        }

        #[test]
        fn earliest_reference_wins() {
            let c = candidate(3, "<m>", &["<a>", "<b>"]);
            let context = ThreadContext {
                related: vec![info(2, 2, "<b>", "t-b"), info(1, 1, "<a>", "t-a")],
                ..ThreadContext::default()
            };

            let resolution = plan(&c, &context, &ThreadingConfig::default());
            assert_eq!(resolution.thread, "t-a");
            assert_eq!(resolution.source, ThreadSource::Reference);
            assert_eq!(
                resolution.merges,
                vec![ThreadMerge {
                    from: "t-b".into(),
                    to: "t-a".into(),
                    since: None,
                }]
            );
        }

        #[test]
        fn duplicate_delivery_adopts_thread() {
            let c = candidate(5, "<m>", &[]);
            let mut copy = info(1, 4, "<m>", "t-m");
            copy.hash = c.hash.clone();
            copy.folder = FolderId(2);
            let context = ThreadContext {
                related: vec![copy],
                ..ThreadContext::default()
            };

            let resolution = plan(&c, &context, &ThreadingConfig::default());
            assert_eq!(resolution.thread, "t-m");
            assert_eq!(resolution.source, ThreadSource::Duplicate);
        }

        #[test]
        fn shared_message_id_is_not_merged() {
            let c = candidate(3, "<m>", &["<a>"]);
            let mut namesake = info(2, 2, "<m>", "t-s");
            namesake.hash = "different".into();
            let context = ThreadContext {
                related: vec![info(1, 1, "<a>", "t-a"), namesake],
                ..ThreadContext::default()
            };

            let resolution = plan(&c, &context, &ThreadingConfig::default());
            assert_eq!(resolution.thread, "t-a");
            assert_eq!(resolution.source, ThreadSource::Reference);
            assert!(resolution.merges.is_empty());
        }

        #[test]
        fn unknown_references_adopt_first() {
            let c = candidate(1, "<m>", &["<a>", "<b>"]);
            let resolution = plan(&c, &ThreadContext::default(), &ThreadingConfig::default());
            assert_eq!(resolution.thread, "<a>");
            assert_eq!(resolution.source, ThreadSource::FirstReference);
        }

        #[test]
        fn own_id_as_first_reference_falls_back() {
            let c = candidate(1, "<m>", &["<m>"]);
            let resolution = plan(&c, &ThreadContext::default(), &ThreadingConfig::default());
            assert_eq!(resolution.thread, "hash1:1");
            assert_eq!(resolution.source, ThreadSource::Fallback);
        }

        #[test]
        fn referencing_messages_are_merged() {
            let c = candidate(1, "<a>", &[]);
            let mut reply = info(1, 2, "<r>", "<a>");
            reply.references = vec!["<a>".into()];
            let context = ThreadContext {
                referencing: vec![reply],
                ..ThreadContext::default()
            };

            let resolution = plan(&c, &context, &ThreadingConfig::default());
            assert_eq!(resolution.thread, "hash1:1");
            assert_eq!(resolution.merges.len(), 1);
            assert_eq!(resolution.merges[0].from, "<a>");
        }

        #[test]
        fn own_row_is_ignored() {
            let c = candidate(1, "<m>", &[]);
            let context = ThreadContext {
                related: vec![info(1, 1, "<m>", "stale")],
                ..ThreadContext::default()
            };

            let resolution = plan(&c, &context, &ThreadingConfig::default());
            assert_eq!(resolution.source, ThreadSource::Fallback);
            assert!(resolution.merges.is_empty());
        }

        #[test]
        fn subject_only_replaces_fallback() {
            let config = ThreadingConfig {
                subject_threading: true,
                ..ThreadingConfig::default()
            };
            let older = info(1, 7, "<x>", "hash7:7");
            let mut newer = info(2, 8, "<y>", "t-y");
            newer.received = older.received + Duration::minutes(5);
            let context = ThreadContext {
                subject: vec![older, newer],
                ..ThreadContext::default()
            };

            let lonely = candidate(1, "<m>", &[]);
            let resolution = plan(&lonely, &context, &config);
            assert_eq!(resolution.thread, "t-y");
            assert_eq!(resolution.source, ThreadSource::Subject);
            assert_eq!(resolution.merges.len(), 1);
            assert_eq!(resolution.merges[0].from, "hash7:7");
            assert!(resolution.merges[0].since.is_some());

            let replying = candidate(2, "<n>", &["<a>"]);
            let resolution = plan(&replying, &context, &config);
            assert_eq!(resolution.source, ThreadSource::FirstReference);
        }
    }

    mod resolver_tests {
        use super::*;

        async fn setup() -> (Arc<MemoryStore>, ThreadResolver, AccountId, FolderId) {
            let store = Arc::new(MemoryStore::new());
            let account = store
                .add_account(&AccountState::new("a", "a@example.com", ImapConfig::default()))
                .await
                .unwrap();
            let folder = store
                .add_folder(&FolderState::new(account, "INBOX"))
                .await
                .unwrap();
            let resolver = ThreadResolver::new(store.clone(), ThreadingConfig::default());
            (store, resolver, account, folder)
        }

        #[tokio::test]
        async fn reply_joins_existing_thread() {
            let (store, resolver, account, folder) = setup().await;
            resolver
                .store(account, folder, &fetched(1, "<a>", &[], None))
                .await
                .unwrap();
            let root = store.message(folder, 1).await.unwrap().unwrap();

            resolver
                .store(account, folder, &fetched(2, "<b>", &[], Some("<a>")))
                .await
                .unwrap();
            let reply = store.message(folder, 2).await.unwrap().unwrap();
            assert_eq!(reply.thread, root.thread);
        }

        #[tokio::test]
        async fn late_root_rewrites_earlier_replies() {
            let (store, resolver, account, folder) = setup().await;

            // Both referenced messages are unknown: the first reference is adopted.
            resolver
                .store(account, folder, &fetched(1, "<m1>", &["<A>", "<B>"], Some("<B>")))
                .await
                .unwrap();
            let first = store.message(folder, 1).await.unwrap().unwrap();
            assert_eq!(first.thread, "<A>");
            assert_eq!(first.references, vec!["<A>".to_string(), "<B>".to_string()]);

            // A sibling sharing the old thread id.
            resolver
                .store(account, folder, &fetched(2, "<m2>", &["<A>"], None))
                .await
                .unwrap();

            resolver
                .store(account, folder, &fetched(3, "<A>", &[], None))
                .await
                .unwrap();
            let root = store.message(folder, 3).await.unwrap().unwrap();
            assert_ne!(root.thread, "<A>");
            for uid in [1, 2] {
                let message = store.message(folder, uid).await.unwrap().unwrap();
                assert_eq!(message.thread, root.thread);
            }
        }

        #[tokio::test]
        async fn reply_to_known_message_pulls_old_thread_along() {
            let (store, resolver, account, folder) = setup().await;
            resolver
                .store(account, folder, &fetched(1, "<a>", &[], None))
                .await
                .unwrap();
            // C replies to B before B is known, so it sits on thread "<b>".
            resolver
                .store(account, folder, &fetched(2, "<c>", &["<b>"], None))
                .await
                .unwrap();
            let c = store.message(folder, 2).await.unwrap().unwrap();
            assert_eq!(c.thread, "<b>");

            resolver
                .store(account, folder, &fetched(3, "<b>", &["<a>"], None))
                .await
                .unwrap();
            let a = store.message(folder, 1).await.unwrap().unwrap();
            for uid in [2, 3] {
                let message = store.message(folder, uid).await.unwrap().unwrap();
                assert_eq!(message.thread, a.thread);
            }
        }
    }

    mod determinism_tests {
        use proptest::prelude::*;

        use super::*;

        fn msgid() -> impl Strategy<Value = String> {
            prop::sample::select(vec!["<a>", "<b>", "<c>", "<d>"]).prop_map(str::to_string)
        }

        proptest! {
            #[test]
            fn plan_ignores_context_order(
                refs in prop::collection::vec(msgid(), 0..4),
                known_ids in prop::collection::vec((msgid(), 0u8..3), 0..6),
            ) {
                let c = candidate(100, "<m>", &[]);
                let c = ThreadCandidate { references: refs, ..c };
                let related: Vec<ThreadInfo> = known_ids
                    .iter()
                    .enumerate()
                    .map(|(i, (id, t))| {
                        let i = i64::try_from(i).unwrap();
                        info(i + 1, u32::try_from(i).unwrap(), id, &format!("t{t}"))
                    })
                    .collect();
                let mut reversed = related.clone();
                reversed.reverse();

                let config = ThreadingConfig::default();
                let forward = plan(&c, &ThreadContext { related, ..ThreadContext::default() }, &config);
                let backward = plan(&c, &ThreadContext { related: reversed, ..ThreadContext::default() }, &config);
                prop_assert_eq!(forward, backward);
            }
        }
    }
}
