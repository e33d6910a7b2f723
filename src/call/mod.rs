//! Loopback call negotiation flow
//!
//! Two endpoints in one process negotiate a call with each other: descriptions
//! and candidates travel over an in-memory [`signaling`] link, media travels
//! over real UDP sockets on the same host.

pub mod endpoint;
pub mod sdp;
pub mod session;
pub mod signaling;

use std::time::Duration;

use tracing::{info, warn};

use crate::{config::DemoConfig, model::codec::CodecPreference};

use self::session::{CallConfig, CallSession};

/// How long the demo waits for both endpoints to finish negotiating.
const NEGOTIATION_GRACE: Duration = Duration::from_secs(10);

/// Runs the call demo: negotiate, hold the call, hang up.
pub async fn run(config: &DemoConfig, codec_preference: Option<CodecPreference>) -> anyhow::Result<()> {
    let mut session = CallSession::call(CallConfig {
        bind_ip: config.endpoint_ip(),
        codec_preference,
    })
    .await?;

    match tokio::time::timeout(NEGOTIATION_GRACE, session.wait_until_negotiated()).await {
        Ok(Ok(())) => info!("Negotiation finished at {}", session.started_at()),
        Ok(Err(e)) => warn!("Negotiation did not finish: {}", e),
        Err(_) => warn!("Negotiation still pending after {:?}", NEGOTIATION_GRACE),
    }

    match tokio::time::timeout(NEGOTIATION_GRACE, session.wait_until_connected()).await {
        Ok(Ok(())) => info!("Call connected"),
        Ok(Err(e)) => warn!("Call did not connect: {}", e),
        Err(_) => warn!("ICE did not connect within {:?}", NEGOTIATION_GRACE),
    }

    tokio::time::sleep(Duration::from_secs(config.call_hold_secs)).await;

    let (pc1, pc2) = session.hang_up().await;
    for snapshot in [&pc1, &pc2] {
        info!(
            "{}: {:?}, ICE {}, codec {}, candidates sent/received {}/{}",
            snapshot.label,
            snapshot.signaling_state,
            snapshot.ice_state.as_deref().unwrap_or("-"),
            snapshot
                .active_codec
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
            snapshot.candidates_sent,
            snapshot.candidates_received,
        );
    }

    Ok(())
}
