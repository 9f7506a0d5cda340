//! Entry point for every frame read from a peer.

use tracing::{debug, warn};

use crate::directory::NodeId;
use crate::message::Message;
use crate::node::ConsensusNode;

/// Decodes `frame` and hands it to its handler. Undecodable frames are
/// logged and dropped; the connection stays open.
pub async fn route(node: &mut ConsensusNode, from: NodeId, frame: &str) {
    match Message::decode(frame) {
        Ok(message) => dispatch(node, from, message).await,
        Err(err) => warn!(peer = %from, error = %err, "dropping frame"),
    }
}

pub async fn dispatch(node: &mut ConsensusNode, from: NodeId, message: Message) {
    debug!(peer = %from, kind = message.kind(), "received");
    match message {
        Message::AddConnection(hello) => {
            // Only meaningful during the handshake.
            warn!(peer = %from, announced = %hello.node_id, "unexpected ADDCONNECTION on an open connection");
        }
        Message::LeaderElection(request) => node.handle_vote_request(request).await,
        Message::VoteResponse(vote) => node.handle_vote_response(vote),
        Message::ElectionResult(result) => node.handle_election_result(result).await,
        Message::Heartbeat(heartbeat) => node.handle_heartbeat(heartbeat).await,
        Message::MissingLog(request) => node.handle_missing_log(request).await,
        Message::AppendLog(batch) => node.handle_append_log(batch).await,
        Message::RequestConsensusVoting(request) => node.handle_voting_request(from, request).await,
        Message::ResponseConsensusVoting(response) => {
            node.handle_voting_response(from, response).await
        }
        Message::ApplyLog(request) => node.handle_apply_log(request).await,
        Message::DeleteLog(request) => node.handle_delete_log(request).await,
    }
}
