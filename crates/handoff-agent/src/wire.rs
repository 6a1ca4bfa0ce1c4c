//! JSON wire types exchanged between agents and clients.
//!
//! Field names are stable, case-sensitive, and shared with the peer agent;
//! the raw Ethernet frame travels base64-encoded.

use serde::{Deserialize, Serialize};

use crate::registry::Process;

/// Two-counter logical clock pairing source and destination progress for
/// one migration. Not a vector clock: the source only ever advances
/// `source_time`; the destination advances `destination_time` locally and
/// overwrites `source_time` with each incoming message's value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MigrationClock {
    pub source_time: u64,
    pub destination_time: u64,
}

/// Client request that starts a migration on the source agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartMigrationRequest {
    pub pid: i32,
    pub destination: String,
    pub source: String,
}

/// Source → destination handshake announcing an inbound migration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlaveStartMigrationMessage {
    pub clock: MigrationClock,
    pub process: Process,
}

/// One captured Ethernet frame in transit to the destination.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShadowTrafficMessage {
    pub clock: MigrationClock,
    #[serde(with = "base64_frame")]
    pub frame: Vec<u8>,
    pub pid: i32,
}

mod base64_frame {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_uses_wire_field_names() {
        let clock = MigrationClock {
            source_time: 3,
            destination_time: 7,
        };
        let json = serde_json::to_value(&clock).expect("encode");
        assert_eq!(json["SourceTime"], 3);
        assert_eq!(json["DestinationTime"], 7);

        let decoded: MigrationClock = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded, clock);
    }

    #[test]
    fn start_migration_request_round_trips() {
        let json = serde_json::json!({
            "Pid": 1234,
            "Destination": "10.0.0.2:8080",
            "Source": "10.0.0.1:8080",
        });
        let request: StartMigrationRequest =
            serde_json::from_value(json.clone()).expect("decode");
        assert_eq!(request.pid, 1234);
        assert_eq!(request.destination, "10.0.0.2:8080");
        assert_eq!(serde_json::to_value(&request).expect("encode"), json);
    }

    #[test]
    fn process_serializes_only_wire_fields() {
        let process = Process::new(42, vec![80], vec![5353]);
        let json = serde_json::to_value(&process).expect("encode");
        assert_eq!(json["Pid"], 42);
        assert_eq!(json["TcpPorts"], serde_json::json!([80]));
        assert_eq!(json["UdpPorts"], serde_json::json!([5353]));
        assert_eq!(
            json.as_object().expect("object").len(),
            3,
            "transient fields must not be serialized"
        );

        let decoded: Process = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded.pid, 42);
        assert!(decoded.done_signal.is_none());
        assert!(decoded.inbox.lock().is_empty());
    }

    #[test]
    fn shadow_traffic_frame_is_base64() {
        let msg = ShadowTrafficMessage {
            clock: MigrationClock::default(),
            frame: vec![0xde, 0xad, 0xbe, 0xef],
            pid: 9,
        };
        let json = serde_json::to_value(&msg).expect("encode");
        assert_eq!(json["Frame"], "3q2+7w==");

        let decoded: ShadowTrafficMessage = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded.frame, msg.frame);
        assert_eq!(decoded.pid, 9);
    }

    #[test]
    fn slave_start_message_round_trips() {
        let msg = SlaveStartMigrationMessage {
            clock: MigrationClock {
                source_time: 1,
                destination_time: 0,
            },
            process: Process::new(1234, vec![80, 443], vec![]),
        };
        let json = serde_json::to_string(&msg).expect("encode");
        let decoded: SlaveStartMigrationMessage = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded.clock, msg.clock);
        assert_eq!(decoded.process.pid, 1234);
        assert_eq!(decoded.process.tcp_ports, vec![80, 443]);
    }
}
