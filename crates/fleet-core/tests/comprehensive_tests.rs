//! # comprehensive core tests
//!
//! why: verify the shared data model behaves the same for every consumer
//! relations: tests fleet-core crate
//! what: peer identity, envelopes, deploy commands, record framing, error taxonomy

use fleet_core::codec::{read_json, read_record, write_json, write_record, HEADER_LEN};
use fleet_core::{
    Archive, Code, ConsensusRole, DeployCommand, DeployOptions, EntryKind, Error, Event, LogEntry,
    Message, Peer, PeerEventKind, PeerStatus,
};
use std::collections::HashSet;
use std::io::Cursor;

fn archive(id: &str) -> Archive {
    Archive {
        deployment_id: id.to_string(),
        checksum: format!("sum-{}", id),
        location: format!("/var/archives/{}", id),
        bytes: 1024,
        initiator: "ops".into(),
        peer: Some(Peer::loopback("node-1")),
        ts: 1_700_000_000_000,
    }
}

// =============================================================================
// SECTION 1: PEER IDENTITY TESTS
// =============================================================================

mod peers {
    use super::*;

    #[test]
    fn peers_hash_by_identity() {
        let mut set = HashSet::new();
        set.insert(Peer::loopback("node-1"));
        set.insert(Peer::loopback("node-1").with_status(PeerStatus::Leaving));
        set.insert(Peer::loopback("node-2"));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn endpoints_share_the_peer_ip() {
        let peer = Peer::loopback("node-1");
        assert_eq!(peer.raft_addr().port(), 2001);
        assert_eq!(peer.rpc_addr().port(), 2000);
        assert_eq!(peer.swim_addr().port(), 2002);
        assert_eq!(peer.raft_addr().ip(), peer.ip);
    }

    #[test]
    fn display_includes_name() {
        assert!(Peer::loopback("node-7").to_string().contains("node-7"));
    }
}

// =============================================================================
// SECTION 2: MESSAGE ENVELOPE TESTS
// =============================================================================

mod envelopes {
    use super::*;

    #[test]
    fn deploy_messages_expose_their_command() {
        let msg = Message::deploy(Peer::loopback("node-1"), DeployCommand::cancel("ops"));
        assert_eq!(msg.deploy_command(), Some(&DeployCommand::cancel("ops")));
        assert!(!msg.hidden);
        assert!(!msg.disallow_wal);
    }

    #[test]
    fn non_deploy_messages_have_no_command() {
        let msg = Message::log(Peer::loopback("node-1"), "hello");
        assert!(msg.deploy_command().is_none());
    }

    #[test]
    fn authority_messages_are_hidden() {
        let msg = Message::authority(
            Peer::loopback("node-1"),
            fleet_core::AuthorityEvent {
                fingerprint: "fp".into(),
                certificate: "cert".into(),
                private_key: "key".into(),
            },
        );
        assert!(msg.hidden);
        assert!(!msg.disallow_wal);
    }

    #[test]
    fn history_messages_nest_other_messages() {
        let origin = Peer::loopback("node-1");
        let inner = vec![
            Message::log(origin.clone(), "one"),
            Message::peer(origin.clone(), PeerEventKind::Joined, Peer::loopback("node-2")),
        ];
        let msg = Message::history(origin, inner.clone());

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded.event {
            Event::History(history) => assert_eq!(history.messages, inner),
            other => panic!("expected history, got {:?}", other),
        }
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = Message::decode(b"not json").unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }
}

// =============================================================================
// SECTION 3: DEPLOY COMMAND TESTS
// =============================================================================

mod deploy_commands {
    use super::*;

    #[test]
    fn completions_are_done_and_failed() {
        let options = DeployOptions::default();
        assert!(DeployCommand::done(archive("a"), options.clone()).is_completion());
        assert!(DeployCommand::failed(archive("a"), options.clone()).is_completion());
        assert!(!DeployCommand::begin(archive("a"), options).is_completion());
        assert!(!DeployCommand::cancel("ops").is_completion());
        assert!(!DeployCommand::restart("ops").is_completion());
    }

    #[test]
    fn commands_carry_archive_and_options() {
        let options = DeployOptions { concurrency: 4, ..DeployOptions::default() };
        let cmd = DeployCommand::failed(archive("b"), options.clone());
        assert_eq!(cmd.archive(), Some(&archive("b")));
        assert_eq!(cmd.options(), Some(&options));
        assert_eq!(cmd.name(), "failed");
    }

    #[test]
    fn commands_are_tagged_on_the_wire() {
        let json = serde_json::to_value(DeployCommand::restart("ops")).unwrap();
        assert_eq!(json["command"], "restart");
        assert_eq!(json["initiator"], "ops");
    }
}

// =============================================================================
// SECTION 4: RECORD FRAMING TESTS
// =============================================================================

mod framing {
    use super::*;

    #[test]
    fn records_read_back_in_order() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"first").unwrap();
        write_record(&mut buf, b"").unwrap();
        write_record(&mut buf, b"third").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_record(&mut cursor).unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_record(&mut cursor).unwrap(), Some(Vec::new()));
        assert_eq!(read_record(&mut cursor).unwrap(), Some(b"third".to_vec()));
        assert_eq!(read_record(&mut cursor).unwrap(), None);
    }

    #[test]
    fn json_records_carry_messages() {
        let msg = Message::deploy(
            Peer::loopback("node-1"),
            DeployCommand::begin(archive("c"), DeployOptions::default()),
        );

        let mut buf = Vec::new();
        write_json(&mut buf, &msg).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + msg.encode().unwrap().len());

        let decoded: Option<Message> = read_json(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, Some(msg));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"complete body").unwrap();
        buf.truncate(buf.len() - 3);

        assert!(read_record(&mut Cursor::new(buf)).is_err());
    }
}

// =============================================================================
// SECTION 5: ERROR TAXONOMY TESTS
// =============================================================================

mod taxonomy {
    use super::*;

    #[test]
    fn every_kind_maps_to_a_code() {
        let cases = vec![
            (Error::PermissionDenied("x".into()), Code::PermissionDenied),
            (Error::NotMember, Code::Unavailable),
            (Error::Malformed("x".into()), Code::FailedPrecondition),
            (Error::Internal("x".into()), Code::Internal),
            (Error::ResourceExhausted("x".into()), Code::ResourceExhausted),
            (Error::NoDeployments, Code::NotFound),
            (Error::Aborted("x".into()), Code::Aborted),
        ];

        for (err, code) in cases {
            assert_eq!(err.code(), code, "{}", err);
        }
    }

    #[test]
    fn only_snapshot_failures_are_fatal() {
        assert!(Error::Snapshot("corrupt".into()).is_fatal());
        assert!(!Error::DeployInProgress.is_fatal());
    }

    #[test]
    fn active_deployment_names_the_archive() {
        let err = Error::ActiveDeployment(Box::new(archive("busy")));
        assert!(err.to_string().contains("busy"));
    }
}

// =============================================================================
// SECTION 6: LOG ENTRY AND ROLE TESTS
// =============================================================================

mod entries {
    use super::*;

    #[test]
    fn only_commands_with_data_carry_payload() {
        assert!(LogEntry::new(1, 1, b"x".to_vec()).has_payload());
        assert!(!LogEntry::new(1, 2, Vec::new()).has_payload());
        assert!(!LogEntry::control(1, 3, EntryKind::Noop).has_payload());
        assert!(!LogEntry::control(1, 4, EntryKind::Configuration).has_payload());
    }

    #[test]
    fn roles_render_lowercase() {
        assert_eq!(ConsensusRole::Leader.to_string(), "leader");
        assert_eq!(ConsensusRole::Passive.to_string(), "passive");
    }
}
