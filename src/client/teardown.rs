// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Best-effort `TEARDOWN`.
//!
//! A `TEARDOWN` that doesn't reach the server leaves a stale session holding
//! transport resources until its timeout, which on some servers (old live555
//! in particular) can wedge other sockets. So try first on the existing
//! connection, then retry on fresh connections with growing timeouts, bounded
//! by the session's own expiry.

use bytes::Bytes;
use rtsp_types::Method;
use url::Url;

use super::{RtspConnection, Session, SessionOptions};
use crate::{error::ErrorInt, Error};

const EXISTING_CONN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const FRESH_CONN_INITIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);
const FRESH_CONN_MAX_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(16);

pub(super) async fn teardown_consumed(
    session: &mut Session<super::Described>,
) -> Result<(), Error> {
    let (session_id, session_timeout) = match session.state.session.take() {
        Some(s) => s,
        None => return Ok(()),
    };
    let base_url = session.state.presentation.base_url.clone();
    teardown(
        &mut session.conn,
        &session.options,
        &base_url,
        &session_id,
        session_timeout,
    )
    .await
}

/// Attempts `TEARDOWN` until success or session expiry.
pub(super) async fn teardown(
    conn: &mut RtspConnection,
    options: &SessionOptions,
    base_url: &Url,
    session_id: &str,
    session_timeout: std::time::Duration,
) -> Result<(), Error> {
    let expires = tokio::time::Instant::now() + session_timeout;
    log::debug!("TEARDOWN {session_id} starting");

    // Attempt first on the existing connection. Besides being the most
    // efficient approach, this is the best for old live555 servers' stale TCP
    // sessions: tearing them down before closing the connection means they
    // don't have a chance to mess up any other sockets.
    match tokio::time::timeout(EXISTING_CONN_TIMEOUT, attempt(conn, options, base_url, session_id))
        .await
    {
        Ok(Ok(())) => {
            log::debug!("TEARDOWN {session_id} on existing conn succeeded");
            return Ok(());
        }
        Ok(Err(e)) => {
            // Retry with a fresh connection. A particularly likely case is
            // when the session was dropped due to a corrupt message; this
            // attempt will inevitably fail reading the same corrupt message,
            // but the server may actually execute the TEARDOWN anyway.
            log::debug!("TEARDOWN {session_id} on existing conn failed: {e}");
        }
        Err(_) => log::debug!("TEARDOWN {session_id} on existing conn timed out"),
    }

    // Now retry with a fresh connection each time, giving longer times to
    // subsequent attempts.
    let mut timeout = FRESH_CONN_INITIAL_TIMEOUT;
    let mut last_err = None;
    for attempt_num in 1.. {
        if tokio::time::Instant::now() >= expires {
            break;
        }
        let one = async {
            let mut conn = RtspConnection::connect(base_url).await?;
            attempt(&mut conn, options, base_url, session_id).await
        };
        match tokio::time::timeout(timeout, one).await {
            Ok(Ok(())) => {
                log::debug!("TEARDOWN {session_id} fresh connection attempt {attempt_num} succeeded");
                return Ok(());
            }
            Ok(Err(e)) => {
                log::debug!("TEARDOWN {session_id} fresh connection attempt {attempt_num} failed: {e}");
                last_err = Some(e);

                // Wait out the remaining time before trying again, to avoid
                // going crazy when the server fails quickly.
                tokio::time::sleep(timeout).await;
            }
            Err(_) => {
                log::debug!("TEARDOWN {session_id} fresh connection attempt {attempt_num} timed out");
                last_err = Some(wrap!(ErrorInt::Timeout));
            }
        }
        timeout = std::cmp::min(timeout * 2, FRESH_CONN_MAX_TIMEOUT);
    }
    log::debug!("TEARDOWN {session_id} aborted on session expiration");
    Err(last_err.unwrap_or_else(|| wrap!(ErrorInt::Timeout)))
}

/// Makes a single attempt on the supplied connection; the caller is
/// responsible for the timeout.
async fn attempt(
    conn: &mut RtspConnection,
    options: &SessionOptions,
    base_url: &Url,
    session_id: &str,
) -> Result<(), Error> {
    let mut req = rtsp_types::Request::builder(Method::Teardown, rtsp_types::Version::V1_0)
        .request_uri(base_url.clone())
        .header(rtsp_types::headers::SESSION, session_id.to_string())
        .build(Bytes::new());
    match conn.send(options, &mut req).await {
        Ok(_) => Ok(()),
        // The server already considers the session gone; that's success.
        Err(e) if e.status_code() == Some(454) => Ok(()),
        Err(e) => Err(e),
    }
}
