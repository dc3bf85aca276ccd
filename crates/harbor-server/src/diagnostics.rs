//! Diagnostics socket: length-prefixed JSON request/response exchanges.
//!
//! Read-only except `close_connection`. Each request must arrive within the
//! configured diagnostics timeout; an idle peer is disconnected.

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use harbor_proto::diag::{DiagRequest, DiagResponse};
use harbor_proto::frame::{write_frame, FrameReader};
use harbor_types::{ConnectionId, ProtocolError};

use crate::controller::Controller;

pub async fn serve(controller: Controller, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(err) = run(&controller, stream).await {
        debug!(%peer, %err, "diagnostics connection failed");
    }
}

async fn run(controller: &Controller, stream: TcpStream) -> Result<(), ProtocolError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = write_half;
    let per_request = controller.diagnostics_timeout();

    loop {
        let frame = match timeout(per_request, reader.next_frame()).await {
            Err(_) => {
                debug!("diagnostics peer idle past the timeout");
                return Ok(());
            }
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(frame))) => frame,
            Ok(Err(err)) => return Err(err),
        };

        let response = match serde_json::from_slice::<DiagRequest>(&frame) {
            Ok(request) => handle(controller, request),
            Err(err) => DiagResponse::err(format!("bad request: {err}")),
        };
        let raw = serde_json::to_vec(&response)
            .map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        write_frame(&mut writer, &raw).await?;
        writer.flush().await?;
    }
}

fn handle(controller: &Controller, request: DiagRequest) -> DiagResponse {
    match request {
        DiagRequest::ListConnections => DiagResponse::ok(&controller.connections_snapshot()),
        DiagRequest::ListIntents => DiagResponse::ok(&controller.intents_snapshot()),
        DiagRequest::ListLocks => DiagResponse::ok(&controller.locks_snapshot()),
        DiagRequest::ListNotificationListeners => {
            DiagResponse::ok(&controller.listeners_snapshot())
        }
        DiagRequest::ListNotificationWait => {
            DiagResponse::ok(&controller.notification_wait_snapshot())
        }
        DiagRequest::TransactionDetails { uid } => {
            match controller.transaction_details(ConnectionId(uid)) {
                Some(details) => DiagResponse::ok(&details),
                None => DiagResponse::err(format!("no open transaction for connection {uid}")),
            }
        }
        DiagRequest::CloseConnection { uid } => {
            if controller.close_connection(ConnectionId(uid)) {
                info!(uid, "connection close requested via diagnostics");
                DiagResponse::ok(&json!({ "closed": uid }))
            } else {
                warn!(uid, "diagnostics asked to close an unknown connection");
                DiagResponse::err(format!("no such connection {uid}"))
            }
        }
    }
}
