//! CORECONF (CBOR, SID-keyed) view of the car status.
//!
//! The server answers a FETCH on SID 60001 with
//! `{60001: {4: {1: {1: <light bit>, 2: <car name>}}}}`, inner keys being SID deltas.
use std::collections::BTreeMap;

use serde_cbor::Value;

use crate::message::{ExteriorLight, LightMessage};

pub const FETCH_SID: u64 = 60001;
const OUTPUT: u64 = 4;
const CAR_STATUS: u64 = 1;
const EXTERIOR_LIGHT: u64 = 1;
const NAME: u64 = 2;

pub fn encode_status(message: &LightMessage) -> Result<Vec<u8>, serde_cbor::Error> {
    let mut status = BTreeMap::new();
    if let Some(light) = message.exterior_light {
        status.insert(key(EXTERIOR_LIGHT), Value::Integer(i128::from(light.bit())));
    }
    status.insert(key(NAME), Value::Text(message.car_name.clone()));
    let tree = nest(FETCH_SID, nest(OUTPUT, nest(CAR_STATUS, Value::Map(status))));
    serde_cbor::to_vec(&tree)
}

pub fn decode_status(payload: &[u8]) -> Result<LightMessage, String> {
    let tree: Value = serde_cbor::from_slice(payload).map_err(|e| e.to_string())?;
    let status = [FETCH_SID, OUTPUT, CAR_STATUS]
        .into_iter()
        .try_fold(&tree, |node, sid| {
            child(node, sid).ok_or_else(|| format!("missing sid {sid} in status tree"))
        })?;

    let car_name = match child(status, NAME) {
        Some(Value::Text(name)) => name.clone(),
        Some(other) => return Err(format!("car name is not text: {other:?}")),
        None => return Err("car name missing".into()),
    };
    let exterior_light = match child(status, EXTERIOR_LIGHT) {
        Some(Value::Integer(bit)) => Some(
            u64::try_from(*bit)
                .ok()
                .and_then(ExteriorLight::from_bit)
                .ok_or_else(|| format!("unknown exterior light bit {bit}"))?,
        ),
        Some(other) => return Err(format!("exterior light is not an integer: {other:?}")),
        None => None,
    };
    Ok(LightMessage {
        car_name,
        exterior_light,
    })
}

fn key(sid: u64) -> Value {
    Value::Integer(i128::from(sid))
}

fn nest(sid: u64, value: Value) -> Value {
    Value::Map(BTreeMap::from([(key(sid), value)]))
}

/// Looks a SID up in a map node; list nodes are indexed positionally.
fn child(node: &Value, sid: u64) -> Option<&Value> {
    match node {
        Value::Map(map) => map.get(&key(sid)),
        Value::Array(items) => usize::try_from(sid).ok().and_then(|i| items.get(i)),
        _ => None,
    }
}
