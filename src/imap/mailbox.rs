use std::fmt;

use async_imap::imap_proto::types::Envelope;
use async_imap::Session;
use chrono::{DateTime, FixedOffset};
use futures::TryStreamExt;
use mail_parser::MessageParser;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::types::{MailboxCheckResult, MailboxCheckResults, Message, ValidatedFolder};
use crate::context::CheckContext;
use crate::error::CheckError;
use crate::sanitize;

/// Capacity of the LIST handoff between stream reader and collector.
const LIST_BUFFER: usize = 10;

// ---------- Mailbox listing & validation ----------

/// Every mailbox name on the server, raw (modified UTF-7), in server order.
///
/// The LIST response stream is drained into a bounded channel while a
/// collector reads from it; the stream's final status is checked only once
/// the collector has everything.
pub async fn list_mailboxes<S>(
    ctx: &CheckContext,
    session: &mut Session<S>,
    account: &str,
) -> Result<Vec<String>, CheckError>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    let (tx, mut rx) = mpsc::channel::<String>(LIST_BUFFER);

    let producer = async move {
        log::debug!("{account}: listing mailboxes");
        let stream = session.list(Some(""), Some("*")).await?;
        let mut stream = std::pin::pin!(stream);
        while let Some(name) = stream.try_next().await? {
            if tx.send(name.name().to_string()).await.is_err() {
                break;
            }
        }
        Ok::<(), async_imap::error::Error>(())
    };

    let consumer = async {
        let mut names = Vec::new();
        while let Some(name) = rx.recv().await {
            log::trace!("{account}: collected mailbox {name}");
            names.push(name);
        }
        names
    };

    let (status, names) = ctx
        .bounded("LIST", async { tokio::join!(producer, consumer) })
        .await?;

    status.map_err(|source| CheckError::List {
        account: account.to_string(),
        source,
    })?;

    log::debug!("{account}: {} mailbox(es) found", names.len());
    Ok(names)
}

fn is_inbox_path(folder: &str) -> bool {
    let lower = folder.to_lowercase();
    lower == "inbox" || lower.starts_with("inbox/")
}

/// Match each requested folder against the server's mailboxes.
///
/// `INBOX` and `INBOX/...` match case-insensitively, everything else must
/// match exactly. The first miss fails the whole validation.
pub fn validate_folders(
    account: &str,
    requested: &[String],
    available: &[String],
) -> Result<Vec<ValidatedFolder>, CheckError> {
    let decoded: Vec<(String, &String)> = available
        .iter()
        .map(|raw| (utf7_imap::decode_utf7_imap(raw.clone()), raw))
        .collect();

    let mut validated = Vec::with_capacity(requested.len());
    for folder in requested {
        let case_insensitive = is_inbox_path(folder);
        let found = decoded.iter().find(|(name, _)| {
            if case_insensitive {
                name.to_lowercase() == folder.to_lowercase()
            } else {
                name == folder
            }
        });

        match found {
            Some((_, raw)) => {
                log::debug!("{account}: mailbox {folder:?} found (case-insensitive: {case_insensitive})");
                validated.push(ValidatedFolder {
                    name: folder.clone(),
                    raw_name: (*raw).clone(),
                });
            }
            None => {
                log::error!("{account}: mailbox {folder:?} not found");
                return Err(CheckError::FolderNotFound {
                    account: account.to_string(),
                    folder: folder.clone(),
                });
            }
        }
    }
    Ok(validated)
}

/// List the server's mailboxes and validate `requested` against them.
pub async fn validate_mailboxes<S>(
    ctx: &CheckContext,
    session: &mut Session<S>,
    account: &str,
    requested: &[String],
) -> Result<Vec<ValidatedFolder>, CheckError>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    let available = list_mailboxes(ctx, session, account).await?;
    validate_folders(account, requested, &available)
}

// ---------- Mail check ----------

/// Examine each folder read-only and collect envelope summaries.
///
/// Stops at the first failing folder.
pub async fn check_mail<S>(
    ctx: &CheckContext,
    session: &mut Session<S>,
    account: &str,
    folders: &[ValidatedFolder],
    replacement: &str,
) -> Result<MailboxCheckResults, CheckError>
where
    S: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    let mut results = MailboxCheckResults::default();

    for folder in folders {
        let mailbox = ctx
            .bounded(&format!("EXAMINE {}", folder.name), session.examine(&folder.raw_name))
            .await?
            .map_err(|source| CheckError::Select {
                account: account.to_string(),
                folder: folder.name.clone(),
                source,
            })?;

        let count = mailbox.exists;
        log::debug!("{account}: {count} mail item(s) found in {}", folder.name);
        if count == 0 {
            results.push(MailboxCheckResult::empty(folder.name.clone()));
            continue;
        }

        let fetch_failed = |source| CheckError::Fetch {
            account: account.to_string(),
            folder: folder.name.clone(),
            source,
        };
        let fetched = ctx
            .guard(&format!("FETCH {}", folder.name), async {
                let stream = session
                    .fetch(format!("1:{count}"), "ENVELOPE")
                    .await
                    .map_err(fetch_failed)?;
                stream.try_collect::<Vec<_>>().await.map_err(fetch_failed)
            })
            .await?;

        // A tagged NO ends the FETCH stream without an error, so a short
        // answer is the only sign the server refused part of the range.
        let messages: Vec<Message> = fetched
            .iter()
            .filter_map(|fetch| {
                let envelope = fetch.envelope();
                if envelope.is_none() {
                    log::warn!("{account}: message {} in {} has no envelope", fetch.message, folder.name);
                }
                envelope
            })
            .map(|envelope| message_from_envelope(envelope, replacement))
            .collect();

        let got = u32::try_from(messages.len()).unwrap_or(u32::MAX);
        if got != count {
            return Err(CheckError::IncompleteFetch {
                account: account.to_string(),
                folder: folder.name.clone(),
                expected: count,
                got,
            });
        }

        results.push(MailboxCheckResult {
            mailbox_name: folder.name.clone(),
            items_found: count,
            messages,
        });
    }

    Ok(results)
}

fn lossy(bytes: Option<&[u8]>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(b).trim().to_string())
        .unwrap_or_default()
}

fn single_line(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .copied()
        .filter(|b| *b != b'\r' && *b != b'\n')
        .collect()
}

/// Decode RFC 2047 words in the subject and parse the date header value.
fn decode_envelope_fields(
    subject: Option<&[u8]>,
    date: Option<&[u8]>,
) -> (String, Option<DateTime<FixedOffset>>) {
    let mut raw = Vec::new();
    if let Some(subject) = subject {
        raw.extend_from_slice(b"Subject: ");
        raw.extend(single_line(subject));
        raw.extend_from_slice(b"\r\n");
    }
    if let Some(date) = date {
        raw.extend_from_slice(b"Date: ");
        raw.extend(single_line(date));
        raw.extend_from_slice(b"\r\n");
    }
    if raw.is_empty() {
        return (String::new(), None);
    }
    raw.extend_from_slice(b"\r\n");

    let parsed = MessageParser::default().parse(&raw[..]);
    let decoded_subject = parsed
        .as_ref()
        .and_then(|m| m.subject())
        .map(str::to_string)
        .unwrap_or_else(|| lossy(subject));
    let parsed_date = parsed.as_ref().and_then(|m| m.date()).and_then(|d| {
        let offset_secs = (i32::from(d.tz_hour) * 3600 + i32::from(d.tz_minute) * 60)
            * if d.tz_before_gmt { -1 } else { 1 };
        let offset = FixedOffset::east_opt(offset_secs)?;
        DateTime::from_timestamp(d.to_timestamp(), 0).map(|utc| utc.with_timezone(&offset))
    });

    (decoded_subject, parsed_date)
}

fn message_from_envelope(envelope: &Envelope<'_>, replacement: &str) -> Message {
    let (original_subject, envelope_date) =
        decode_envelope_fields(envelope.subject.as_deref(), envelope.date.as_deref());

    let modified_subject = match sanitize::sanitize_subject(&original_subject, replacement) {
        std::borrow::Cow::Borrowed(_) => None,
        std::borrow::Cow::Owned(modified) => Some(modified),
    };

    Message::new(
        lossy(envelope.message_id.as_deref()),
        envelope_date,
        original_subject,
        modified_subject,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::testing::{logged_in_server, session_for};
    use crate::sanitize::DEFAULT_REPLACEMENT;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn inbox_matches_case_insensitively() {
        let validated =
            validate_folders("acct", &names(&["inbox", "INBOX/Reports"]), &names(&["INBOX", "Inbox/reports"]))
                .unwrap();
        assert_eq!(validated[0].raw_name, "INBOX");
        assert_eq!(validated[1].raw_name, "Inbox/reports");
        assert_eq!(validated[1].name, "INBOX/Reports");
    }

    #[test]
    fn other_folders_match_case_sensitively() {
        let err = validate_folders("acct", &names(&["spam"]), &names(&["INBOX", "Spam"])).unwrap_err();
        assert!(matches!(err, CheckError::FolderNotFound { ref folder, .. } if folder == "spam"));

        let ok = validate_folders("acct", &names(&["Spam"]), &names(&["INBOX", "Spam"])).unwrap();
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn first_missing_folder_is_fatal() {
        let err = validate_folders("acct", &names(&["Inbox", "Ghost"]), &names(&["INBOX", "Trash"]))
            .unwrap_err();
        assert_eq!(err.to_string(), "acct: mailbox not found: \"Ghost\"");
    }

    #[test]
    fn utf7_names_are_decoded_for_comparison() {
        let validated =
            validate_folders("acct", &names(&["Entw\u{fc}rfe"]), &names(&["Entw&APw-rfe"])).unwrap();
        assert_eq!(validated[0].raw_name, "Entw&APw-rfe");
    }

    #[test]
    fn encoded_subject_and_date_are_decoded() {
        let (subject, date) = decode_envelope_fields(
            Some(b"=?UTF-8?B?8J+OiSBQYXJ0eQ==?="),
            Some(b"Mon, 7 Feb 1994 21:52:25 -0800"),
        );
        assert_eq!(subject, "\u{1F389} Party");
        let date = date.unwrap();
        assert_eq!(date.to_rfc3339(), "1994-02-07T21:52:25-08:00");
    }

    #[test]
    fn missing_envelope_fields() {
        assert_eq!(decode_envelope_fields(None, None), (String::new(), None));
    }

    #[tokio::test]
    async fn listing_collects_every_mailbox() {
        let (client, _server) = logged_in_server(|tag, command| {
            assert!(command.starts_with("LIST"));
            let mut reply = String::new();
            for i in 0..25 {
                reply.push_str(&format!("* LIST (\\HasNoChildren) \"/\" \"Folder{i}\"\r\n"));
            }
            reply.push_str(&format!("{tag} OK LIST completed\r\n"));
            reply
        });
        let mut session = session_for(client).await;
        let listed = list_mailboxes(&CheckContext::default(), &mut session, "acct")
            .await
            .unwrap();
        assert_eq!(listed.len(), 25);
        assert_eq!(listed[0], "Folder0");
        assert_eq!(listed[24], "Folder24");
    }

    #[tokio::test]
    async fn stalled_listing_times_out() {
        let (client, _server) = logged_in_server(|_, _| String::new());
        let mut session = session_for(client).await;
        let ctx = CheckContext::new(std::time::Duration::from_millis(50));
        let err = list_mailboxes(&ctx, &mut session, "acct").await.unwrap_err();
        assert!(matches!(err, CheckError::Timeout { ref operation, .. } if operation == "LIST"));
    }

    #[tokio::test]
    async fn check_mail_collects_envelopes_and_empty_folders() {
        let (client, server) = logged_in_server(|tag, command| {
            if command.starts_with("EXAMINE \"INBOX\"") {
                format!("* 2 EXISTS\r\n* 0 RECENT\r\n* FLAGS (\\Seen)\r\n{tag} OK [READ-ONLY] EXAMINE completed\r\n")
            } else if command.starts_with("EXAMINE") {
                format!("* 0 EXISTS\r\n* 0 RECENT\r\n{tag} OK [READ-ONLY] EXAMINE completed\r\n")
            } else if command.starts_with("FETCH 1:2 ENVELOPE") {
                format!(
                    "* 1 FETCH (ENVELOPE (\"Mon, 7 Feb 1994 21:52:25 -0800\" \"50% off #1 deal | today\" NIL NIL NIL NIL NIL NIL NIL \"<one@example.com>\"))\r\n\
                     * 2 FETCH (ENVELOPE (\"Tue, 8 Feb 1994 10:00:00 +0000\" \"Weekly status\" NIL NIL NIL NIL NIL NIL NIL \"<two@example.com>\"))\r\n\
                     {tag} OK FETCH completed\r\n"
                )
            } else {
                format!("{tag} BAD unexpected\r\n")
            }
        });

        let mut session = session_for(client).await;
        let folders = vec![
            ValidatedFolder {
                name: "Inbox".into(),
                raw_name: "INBOX".into(),
            },
            ValidatedFolder {
                name: "Spam".into(),
                raw_name: "Spam".into(),
            },
        ];
        let results = check_mail(&CheckContext::default(), &mut session, "acct", &folders, DEFAULT_REPLACEMENT)
            .await
            .unwrap();
        session.logout().await.unwrap();
        drop(session);

        assert_eq!(results.messages_found_summary(), "Inbox(2), Spam(0)");
        assert_eq!(results.total_messages_found(), 2);
        assert!(results.got_mail());

        let inbox = &results.0[0];
        assert_eq!(inbox.messages.len(), 2);
        assert_eq!(inbox.messages[0].original_subject, "50% off #1 deal | today");
        assert_eq!(
            inbox.messages[0].modified_subject.as_deref(),
            Some("50% off &#35;1 deal &#124; today")
        );
        assert_eq!(inbox.messages[0].message_id, "<one@example.com>");
        assert_eq!(inbox.messages[0].envelope_date_formatted, "1994-02-07T21:52:25-08:00");
        assert_eq!(inbox.messages[1].modified_subject, None);
        assert_eq!(inbox.messages[1].envelope_date_formatted, "1994-02-08T10:00:00Z");

        let spam = &results.0[1];
        assert_eq!(spam.items_found, 0);
        assert!(spam.messages.is_empty());

        let received = server.await.unwrap();
        assert!(received.iter().all(|l| !l.contains("SELECT")));
    }

    fn inbox() -> Vec<ValidatedFolder> {
        vec![ValidatedFolder {
            name: "Inbox".into(),
            raw_name: "INBOX".into(),
        }]
    }

    /// Server with two messages in every folder; FETCH is answered by
    /// `fetch_reply` given the command tag.
    fn two_messages_then(
        fetch_reply: fn(&str) -> String,
    ) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<Vec<String>>) {
        logged_in_server(move |tag, command| {
            if command.starts_with("EXAMINE") {
                format!("* 2 EXISTS\r\n* 0 RECENT\r\n{tag} OK [READ-ONLY] EXAMINE completed\r\n")
            } else {
                fetch_reply(tag)
            }
        })
    }

    #[tokio::test]
    async fn fetch_failure_aborts_check() {
        let (client, _server) =
            two_messages_then(|tag| format!("{tag} NO [UNAVAILABLE] backend down\r\n"));
        let mut session = session_for(client).await;
        let err = check_mail(&CheckContext::default(), &mut session, "acct", &inbox(), DEFAULT_REPLACEMENT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckError::Fetch { ref folder, .. } | CheckError::IncompleteFetch { ref folder, .. }
                if folder == "Inbox"
        ));
        assert_eq!(err.stage(), crate::error::Stage::Check);
    }

    #[tokio::test]
    async fn short_fetch_is_an_error() {
        let (client, _server) = two_messages_then(|tag| {
            format!(
                "* 1 FETCH (ENVELOPE (\"Mon, 7 Feb 1994 21:52:25 -0800\" \"Only one\" NIL NIL NIL NIL NIL NIL NIL \"<one@example.com>\"))\r\n\
                 {tag} OK FETCH completed\r\n"
            )
        });
        let mut session = session_for(client).await;
        let err = check_mail(&CheckContext::default(), &mut session, "acct", &inbox(), DEFAULT_REPLACEMENT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckError::IncompleteFetch { expected: 2, got: 1, ref folder, .. } if folder == "Inbox"
        ));
    }

    #[tokio::test]
    async fn select_failure_aborts_check() {
        let (client, _server) =
            logged_in_server(|tag, _| format!("{tag} NO [NONEXISTENT] Unknown mailbox\r\n"));
        let mut session = session_for(client).await;
        let folders = vec![ValidatedFolder {
            name: "Archive".into(),
            raw_name: "Archive".into(),
        }];
        let err = check_mail(&CheckContext::default(), &mut session, "acct", &folders, DEFAULT_REPLACEMENT)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Select { ref folder, .. } if folder == "Archive"));
    }
}
