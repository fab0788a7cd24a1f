use protobuf::Message;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protos::RadarMessage::RadarMessage;
use crate::radar::{RadarError, SpokeBearing};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One angular sample as it came off the wire. The sweep buffer copies the
/// samples, so a Spoke is dropped right after it has been written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spoke {
    pub angle: SpokeBearing,
    pub bearing: Option<SpokeBearing>,
    pub range_meters: u32,
    pub timestamp: u64, // millis since epoch
    pub samples: Vec<u8>,
}

impl Spoke {
    pub fn new(angle: SpokeBearing, range_meters: u32, samples: Vec<u8>) -> Self {
        Spoke {
            angle,
            bearing: None,
            range_meters,
            timestamp: now_millis(),
            samples,
        }
    }
}

///
/// Decode one websocket frame from the spoke stream. A frame is a serialized
/// `RadarMessage` carrying zero or more spokes; an empty message is valid.
///
pub fn decode_radar_message(data: &[u8]) -> Result<Vec<Spoke>, RadarError> {
    let message = RadarMessage::parse_from_bytes(data)?;
    let received = now_millis();

    let spokes = message
        .spokes
        .into_iter()
        .map(|spoke| Spoke {
            angle: spoke.angle,
            bearing: spoke.bearing,
            range_meters: spoke.range,
            timestamp: spoke.time.unwrap_or(received),
            samples: spoke.data,
        })
        .collect();

    Ok(spokes)
}

#[cfg(test)]
pub(crate) fn encode_radar_message(radar: u32, spokes: &[Spoke]) -> Vec<u8> {
    use crate::protos::RadarMessage::radar_message;

    let mut message = RadarMessage::new();
    message.radar = radar;
    for s in spokes {
        let mut spoke = radar_message::Spoke::new();
        spoke.angle = s.angle;
        spoke.bearing = s.bearing;
        spoke.range = s.range_meters;
        spoke.time = Some(s.timestamp);
        spoke.data = s.samples.clone();
        message.spokes.push(spoke);
    }
    message.write_to_bytes().unwrap()
}
