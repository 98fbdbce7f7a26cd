//! Binary device protocol: envelope messages, frame splitting and command
//! dispatch.
//!
//! A binary push payload holds one or more concatenated `SendHeaderMsg`
//! frames. Each frame is the length-delimited header (field 1), so
//! [`split_frames`] walks the outer length prefixes and only falls back to
//! cutting after the device serial number when a prefix does not fit.

use crate::error::DecodeError;
use crate::sample::{Sample, Value, TIMESTAMP_ATTR};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const CMD_HEARTBEAT: i32 = 1;
pub const CMD_POWER_STREAM: i32 = 32;

// Field 1, wire type 2: the header inside `SendHeaderMsg`.
const ENVELOPE_KEY: u8 = 0x0a;

#[derive(Clone, PartialEq, Message)]
pub struct Header {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub pdata: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "2")]
    pub src: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub dest: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub d_src: Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub d_dest: Option<i32>,
    #[prost(int32, optional, tag = "6")]
    pub enc_type: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    pub check_type: Option<i32>,
    #[prost(int32, optional, tag = "8")]
    pub cmd_func: Option<i32>,
    #[prost(int32, optional, tag = "9")]
    pub cmd_id: Option<i32>,
    #[prost(int32, optional, tag = "10")]
    pub data_len: Option<i32>,
    #[prost(int32, optional, tag = "11")]
    pub need_ack: Option<i32>,
    #[prost(int32, optional, tag = "12")]
    pub is_ack: Option<i32>,
    #[prost(int32, optional, tag = "14")]
    pub seq: Option<i32>,
    #[prost(int32, optional, tag = "15")]
    pub product_id: Option<i32>,
    #[prost(int32, optional, tag = "16")]
    pub version: Option<i32>,
    #[prost(int32, optional, tag = "17")]
    pub payload_ver: Option<i32>,
    #[prost(int32, optional, tag = "18")]
    pub time_snap: Option<i32>,
    #[prost(int32, optional, tag = "19")]
    pub is_rw_cmd: Option<i32>,
    #[prost(int32, optional, tag = "20")]
    pub is_queue: Option<i32>,
    #[prost(int32, optional, tag = "21")]
    pub ack_type: Option<i32>,
    #[prost(string, optional, tag = "22")]
    pub code: Option<String>,
    #[prost(string, optional, tag = "23")]
    pub from: Option<String>,
    #[prost(string, optional, tag = "24")]
    pub module_sn: Option<String>,
    #[prost(string, optional, tag = "25")]
    pub device_sn: Option<String>,
}

impl Header {
    /// One-line rendering of the routing fields, for diagnostics.
    pub fn summary(&self) -> String {
        format!(
            "sn={} src={} dest={} d_src={} d_dest={} cmd_id={} cmd_func={} seq={} need_ack={} data_len={} version={} payload_ver={}",
            self.device_sn(),
            self.src(),
            self.dest(),
            self.d_src(),
            self.d_dest(),
            self.cmd_id(),
            self.cmd_func(),
            self.seq(),
            self.need_ack(),
            self.data_len(),
            self.version(),
            self.payload_ver()
        )
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct SendHeaderMsg {
    #[prost(message, optional, tag = "1")]
    pub msg: Option<Header>,
}

#[derive(Clone, PartialEq, Message)]
pub struct InverterHeartbeat {
    #[prost(uint32, optional, tag = "1")]
    pub inv_err_code: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub inv_warn_code: Option<u32>,
    #[prost(int32, optional, tag = "16")]
    pub pv1_input_volt: Option<i32>,
    #[prost(int32, optional, tag = "17")]
    pub pv1_op_volt: Option<i32>,
    #[prost(int32, optional, tag = "18")]
    pub pv1_input_cur: Option<i32>,
    #[prost(int32, optional, tag = "19")]
    pub pv1_input_watts: Option<i32>,
    #[prost(int32, optional, tag = "20")]
    pub pv1_temp: Option<i32>,
    #[prost(int32, optional, tag = "21")]
    pub pv2_input_volt: Option<i32>,
    #[prost(int32, optional, tag = "22")]
    pub pv2_op_volt: Option<i32>,
    #[prost(int32, optional, tag = "23")]
    pub pv2_input_cur: Option<i32>,
    #[prost(int32, optional, tag = "24")]
    pub pv2_input_watts: Option<i32>,
    #[prost(int32, optional, tag = "25")]
    pub pv2_temp: Option<i32>,
    #[prost(int32, optional, tag = "26")]
    pub bat_input_volt: Option<i32>,
    #[prost(int32, optional, tag = "27")]
    pub bat_op_volt: Option<i32>,
    #[prost(int32, optional, tag = "28")]
    pub bat_input_cur: Option<i32>,
    #[prost(int32, optional, tag = "29")]
    pub bat_input_watts: Option<i32>,
    #[prost(int32, optional, tag = "30")]
    pub bat_temp: Option<i32>,
    #[prost(uint32, optional, tag = "31")]
    pub bat_soc: Option<u32>,
    #[prost(int32, optional, tag = "35")]
    pub inv_input_volt: Option<i32>,
    #[prost(int32, optional, tag = "36")]
    pub inv_op_volt: Option<i32>,
    #[prost(int32, optional, tag = "37")]
    pub inv_output_cur: Option<i32>,
    #[prost(int32, optional, tag = "38")]
    pub inv_output_watts: Option<i32>,
    #[prost(int32, optional, tag = "39")]
    pub inv_temp: Option<i32>,
    #[prost(int32, optional, tag = "40")]
    pub inv_freq: Option<i32>,
    #[prost(uint32, optional, tag = "46")]
    pub install_country: Option<u32>,
    #[prost(uint32, optional, tag = "47")]
    pub install_town: Option<u32>,
    #[prost(uint32, optional, tag = "48")]
    pub permanent_watts: Option<u32>,
    #[prost(uint32, optional, tag = "49")]
    pub dynamic_watts: Option<u32>,
    #[prost(uint32, optional, tag = "50")]
    pub supply_priority: Option<u32>,
    #[prost(uint32, optional, tag = "51")]
    pub lower_limit: Option<u32>,
    #[prost(uint32, optional, tag = "52")]
    pub upper_limit: Option<u32>,
    #[prost(uint32, optional, tag = "53")]
    pub inv_on_off: Option<u32>,
    #[prost(uint32, optional, tag = "56")]
    pub inv_brightness: Option<u32>,
    #[prost(uint32, optional, tag = "57")]
    pub heartbeat_frequency: Option<u32>,
    #[prost(uint32, optional, tag = "58")]
    pub rated_power: Option<u32>,
    #[prost(uint32, optional, tag = "61")]
    pub timestamp: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PowerItem {
    #[prost(uint32, optional, tag = "1")]
    pub timestamp: Option<u32>,
    #[prost(sint32, optional, tag = "2")]
    pub timezone: Option<i32>,
    #[prost(uint32, optional, tag = "3")]
    pub inv_to_grid_power: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub inv_to_plug_power: Option<u32>,
    #[prost(int32, optional, tag = "5")]
    pub battery_power: Option<i32>,
    #[prost(uint32, optional, tag = "6")]
    pub pv1_output_power: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub pv2_output_power: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PowerPack {
    #[prost(uint32, optional, tag = "1")]
    pub sys_seq: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub sys_power_stream: Vec<PowerItem>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PowerAckPack {
    #[prost(uint32, optional, tag = "1")]
    pub sys_seq: Option<u32>,
}

/// A decoded payload record, stored as its own sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Heartbeat(InverterHeartbeat),
    Power(PowerItem),
}

impl Record {
    /// Stream kind used in the destination name.
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Heartbeat(_) => "inverterheartbeat",
            Record::Power(_) => "poweritem",
        }
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        let secs = match self {
            Record::Heartbeat(h) => h.timestamp?,
            Record::Power(p) => p.timestamp?,
        };
        Utc.timestamp_opt(i64::from(secs), 0).single()
    }

    /// Present fields as attributes; absent optional fields are left out.
    pub fn attributes(&self) -> BTreeMap<String, Value> {
        let mut attrs = BTreeMap::new();
        let mut put = |name: &str, v: Option<i64>| {
            if let Some(v) = v {
                attrs.insert(name.to_string(), Value::Integer(v));
            }
        };
        match self {
            Record::Heartbeat(h) => {
                let u = |v: Option<u32>| v.map(i64::from);
                let i = |v: Option<i32>| v.map(i64::from);
                put("inv_err_code", u(h.inv_err_code));
                put("inv_warn_code", u(h.inv_warn_code));
                put("pv1_input_volt", i(h.pv1_input_volt));
                put("pv1_op_volt", i(h.pv1_op_volt));
                put("pv1_input_cur", i(h.pv1_input_cur));
                put("pv1_input_watts", i(h.pv1_input_watts));
                put("pv1_temp", i(h.pv1_temp));
                put("pv2_input_volt", i(h.pv2_input_volt));
                put("pv2_op_volt", i(h.pv2_op_volt));
                put("pv2_input_cur", i(h.pv2_input_cur));
                put("pv2_input_watts", i(h.pv2_input_watts));
                put("pv2_temp", i(h.pv2_temp));
                put("bat_input_volt", i(h.bat_input_volt));
                put("bat_op_volt", i(h.bat_op_volt));
                put("bat_input_cur", i(h.bat_input_cur));
                put("bat_input_watts", i(h.bat_input_watts));
                put("bat_temp", i(h.bat_temp));
                put("bat_soc", u(h.bat_soc));
                put("inv_input_volt", i(h.inv_input_volt));
                put("inv_op_volt", i(h.inv_op_volt));
                put("inv_output_cur", i(h.inv_output_cur));
                put("inv_output_watts", i(h.inv_output_watts));
                put("inv_temp", i(h.inv_temp));
                put("inv_freq", i(h.inv_freq));
                put("install_country", u(h.install_country));
                put("install_town", u(h.install_town));
                put("permanent_watts", u(h.permanent_watts));
                put("dynamic_watts", u(h.dynamic_watts));
                put("supply_priority", u(h.supply_priority));
                put("lower_limit", u(h.lower_limit));
                put("upper_limit", u(h.upper_limit));
                put("inv_on_off", u(h.inv_on_off));
                put("inv_brightness", u(h.inv_brightness));
                put("heartbeat_frequency", u(h.heartbeat_frequency));
                put("rated_power", u(h.rated_power));
            }
            Record::Power(p) => {
                put("timezone", p.timezone.map(i64::from));
                put("inv_to_grid_power", p.inv_to_grid_power.map(i64::from));
                put("inv_to_plug_power", p.inv_to_plug_power.map(i64::from));
                put("battery_power", p.battery_power.map(i64::from));
                put("pv1_output_power", p.pv1_output_power.map(i64::from));
                put("pv2_output_power", p.pv2_output_power.map(i64::from));
            }
        }
        if let Some(ts) = self.timestamp() {
            attrs.insert(TIMESTAMP_ATTR.to_string(), Value::Timestamp(ts));
        }
        attrs
    }

    pub fn into_sample(self, device_sn: &str) -> Sample {
        Sample::new(device_sn, self.attributes())
    }
}

/// Outcome of dispatching one frame on its command id.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Heartbeat(InverterHeartbeat),
    PowerStream(Vec<PowerItem>),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub body: Body,
}

impl Frame {
    /// False for command ids without a payload decoder.
    pub fn handled(&self) -> bool {
        !matches!(self.body, Body::Unknown)
    }

    /// Serial number carried in the header, or `fallback` when it is empty.
    pub fn device_sn<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self.header.device_sn.as_deref() {
            Some(sn) if !sn.is_empty() => sn,
            _ => fallback,
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        match self.body {
            Body::Heartbeat(h) => vec![Record::Heartbeat(h)],
            Body::PowerStream(items) => items.into_iter().map(Record::Power).collect(),
            Body::Unknown => Vec::new(),
        }
    }
}

/// Cuts a payload into `SendHeaderMsg` frames using their outer length
/// prefix. Where that prefix is missing or too long the frame ends right after
/// the next occurrence of `sn`, or at the end of the payload.
pub fn split_frames<'a>(payload: &'a [u8], sn: &str) -> Vec<&'a [u8]> {
    let mut frames = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let end = framed_len(rest).unwrap_or_else(|| sn_boundary(rest, sn.as_bytes()));
        let (frame, tail) = rest.split_at(end);
        frames.push(frame);
        rest = tail;
    }
    frames
}

/// Length of the `SendHeaderMsg` at the start of `buf`, read from its
/// `0x0a <varint len>` prefix. `None` when the prefix is missing or runs past
/// the buffer.
fn framed_len(buf: &[u8]) -> Option<usize> {
    let (&key, mut tail) = buf.split_first()?;
    if key != ENVELOPE_KEY {
        return None;
    }
    let before = tail.len();
    let len = prost::encoding::decode_varint(&mut tail).ok()?;
    let end = (1 + before - tail.len()).checked_add(usize::try_from(len).ok()?)?;
    (end <= buf.len()).then_some(end)
}

fn sn_boundary(buf: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() {
        return buf.len();
    }
    buf.windows(needle.len())
        .position(|w| w == needle)
        .map_or(buf.len(), |idx| idx + needle.len())
}

pub fn decode_envelope(frame: &[u8]) -> Result<Header, DecodeError> {
    let msg = SendHeaderMsg::decode(frame).map_err(DecodeError::Envelope)?;
    msg.msg.ok_or(DecodeError::MissingHeader)
}

/// Decodes the envelope and its payload. Unknown command ids are not an
/// error: the frame comes back with [`Body::Unknown`].
pub fn decode_frame(frame: &[u8]) -> Result<Frame, DecodeError> {
    debug!(base64 = %STANDARD_NO_PAD.encode(frame), len = frame.len(), "binary frame");
    let header = decode_envelope(frame)?;
    let cmd_id = header.cmd_id();
    let pdata = header.pdata();
    let payload_err = |source| DecodeError::Payload { cmd_id, source };

    let body = match cmd_id {
        CMD_HEARTBEAT => {
            let hb = InverterHeartbeat::decode(pdata).map_err(payload_err)?;
            debug!(
                permanent_watts = hb.permanent_watts(),
                dynamic_watts = hb.dynamic_watts(),
                lower_limit = hb.lower_limit(),
                upper_limit = hb.upper_limit(),
                timestamp = hb.timestamp(),
                "inverter heartbeat"
            );
            Body::Heartbeat(hb)
        }
        CMD_POWER_STREAM => {
            let pack = PowerPack::decode(pdata).map_err(payload_err)?;
            debug!(sys_seq = pack.sys_seq(), items = pack.sys_power_stream.len(), "power pack");
            Body::PowerStream(pack.sys_power_stream)
        }
        _ => {
            info!(cmd_id, header = %header.summary(), "unknown command id");
            debug!(base64 = %STANDARD_NO_PAD.encode(frame), "unknown command payload");
            Body::Unknown
        }
    };
    Ok(Frame { header, body })
}
