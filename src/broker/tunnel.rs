//! Per-CONNECT tunnel controller
//!
//! The state machine for one inbound CONNECT: authenticate, allocate a
//! rendezvous port, command the agent, wait for the dial-back, then splice.
//! Errors before the 200 OK surface as HTTP statuses; after it the stream is
//! hijacked and errors are only logged.

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{http, BrokerContext, BrokerError};
use crate::protocol::TunnelCommand;
use crate::registry::AgentHandle;
use crate::rendezvous;
use crate::splice;

pub(crate) async fn serve_connect(
    ctx: Arc<BrokerContext>,
    mut reader: BufReader<TcpStream>,
    head: http::RequestHead,
) -> Result<(), BrokerError> {
    let handle = match authenticate(&ctx, &head) {
        Some(handle) => handle,
        None => {
            http::respond_auth_required(reader.get_mut()).await?;
            return Err(BrokerError::AuthFailed);
        }
    };

    // Validate the target before burning a rendezvous port on it.
    if let Err(error) = crate::protocol::validate_destination(&head.target) {
        warn!(target = %head.target, %error, "rejecting CONNECT with invalid target");
        http::respond_not_found(reader.get_mut(), "malformed destination\n").await?;
        return Err(BrokerError::Protocol(error));
    }

    let listener = match rendezvous::allocate(ctx.rendezvous_range).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(range = %ctx.rendezvous_range, "rendezvous range exhausted");
            http::respond_bad_gateway(reader.get_mut()).await?;
            return Err(error.into());
        }
    };

    let command = TunnelCommand::new(listener.port(), head.target.as_str())?;
    info!(
        account = %handle.name(),
        destination = %command.destination,
        port = command.rendezvous_port,
        "establishing tunnel"
    );

    if let Err(error) = handle.send_command(&command).await {
        // The control channel is dead; evict it so the next CONNECT gets an
        // immediate 407 instead of another doomed command.
        ctx.registry.unregister(handle.name(), handle.id());
        handle.close().await;
        http::respond_not_found(reader.get_mut(), "agent unreachable\n").await?;
        return Err(BrokerError::ControlWriteFailed(error));
    }

    let agent_leg = match listener.accept_within(ctx.dial_back_timeout).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(account = %handle.name(), %error, "no dial-back from agent");
            http::respond_not_found(reader.get_mut(), "agent did not dial back\n").await?;
            return Err(error.into());
        }
    };

    // Slot held for the whole splice. The semaphore is only closed on
    // shutdown, at which point abandoning the session is the right outcome.
    let _permit = match ctx.tunnel_slots.acquire().await {
        Ok(permit) => permit,
        Err(_) => return Ok(()),
    };

    http::respond_ok(reader.get_mut()).await?;

    // Hijack: hand the raw stream to the splicer, carrying over any bytes the
    // client pipelined behind its header section.
    let preface = reader.buffer().to_vec();
    let client_leg = reader.into_inner();

    let summary = splice::splice_with_preface(client_leg, &preface, agent_leg).await;
    if let Some(error) = &summary.error {
        debug!(account = %handle.name(), %error, "tunnel ended with error");
    }
    info!(
        account = %handle.name(),
        destination = %command.destination,
        client_to_agent = summary.a_to_b,
        agent_to_client = summary.b_to_a,
        "tunnel closed"
    );
    Ok(())
}

/// Resolve the CONNECT credentials to a live agent.
///
/// Requires the account to exist with a matching secret and the agent to be
/// online; any miss collapses to the same 407 so probes cannot distinguish
/// unknown accounts from offline agents.
fn authenticate(ctx: &BrokerContext, head: &http::RequestHead) -> Option<Arc<AgentHandle>> {
    let (name, secret) = http::basic_credentials(head)?;
    if !ctx.accounts.verify(&name, &secret) {
        debug!(account = %name, "unknown account or wrong secret");
        return None;
    }
    ctx.registry.lookup(&name)
}
