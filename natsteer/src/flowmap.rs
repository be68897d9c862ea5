use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use aya::maps::{HashMap as FlowMap, Map, MapData};
use serde_json::{Map as JsonMap, Value};

use natsteer_common::{FlowKey, FlowRecord};

/// Opens the pinned flow map left behind by `attach`, so entries can be
/// managed without restarting the datapath.
fn open<P: AsRef<Path>>(pin_path: P) -> Result<FlowMap<MapData, FlowKey, FlowRecord>> {
    let pin = pin_path.as_ref();
    let map_data = MapData::from_pin(pin)
        .map_err(|e| anyhow!("failed to open pinned map at {}: {}", pin.display(), e))?;
    // The pin carries no type tag, so wrap it as the map kind we pinned;
    // try_from still rejects a pin whose fd is not a hash map.
    let map_enum = Map::HashMap(map_data);
    FlowMap::<_, FlowKey, FlowRecord>::try_from(map_enum)
        .map_err(|e| anyhow!("failed to convert to HashMap: {}", e))
}

/// Installs or overwrites the entry for a tracked destination.
pub fn update<P: AsRef<Path>>(pin_path: P, addr: Ipv4Addr, count: u16) -> Result<()> {
    let mut map = open(pin_path)?;
    map.insert(key_for(addr), FlowRecord { count }, 0)
        .with_context(|| format!("failed to install flow entry for {addr}"))?;
    Ok(())
}

pub fn delete<P: AsRef<Path>>(pin_path: P, addr: Ipv4Addr) -> Result<()> {
    let mut map = open(pin_path)?;
    map.remove(&key_for(addr))
        .with_context(|| format!("failed to remove flow entry for {addr}"))?;
    Ok(())
}

pub fn get<P: AsRef<Path>>(pin_path: P, addr: Ipv4Addr) -> Result<u16> {
    let map = open(pin_path)?;
    let record = map
        .get(&key_for(addr), 0)
        .with_context(|| format!("no flow entry for {addr}"))?;
    Ok(record.count)
}

/// Returns every tracked destination with its hit counter as a JSON array.
pub fn dump<P: AsRef<Path>>(pin_path: P) -> Result<Value> {
    let map = open(pin_path)?;
    let mut entries = Vec::new();
    for item in map.iter() {
        let (key, record): (FlowKey, FlowRecord) =
            item.map_err(|e| anyhow!("aya iter error: {}", e))?;
        entries.push((key, record));
    }
    Ok(entries_to_json(entries))
}

fn entries_to_json(entries: impl IntoIterator<Item = (FlowKey, FlowRecord)>) -> Value {
    let mut dumped = Vec::new();
    for (key, record) in entries {
        let mut obj = JsonMap::new();
        obj.insert(
            "address".to_string(),
            Value::String(addr_for(&key).to_string()),
        );
        obj.insert("count".to_string(), Value::Number(record.count.into()));
        dumped.push(Value::Object(obj));
    }
    Value::Array(dumped)
}

pub fn key_for(addr: Ipv4Addr) -> FlowKey {
    FlowKey::from_octets(addr.octets())
}

pub fn addr_for(key: &FlowKey) -> Ipv4Addr {
    Ipv4Addr::from(key.octets())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrips_through_dotted_quad() {
        for text in ["10.0.0.7", "192.0.2.17", "255.255.255.255", "0.0.0.0"] {
            let addr: Ipv4Addr = text.parse().unwrap();
            assert_eq!(addr_for(&key_for(addr)), addr);
        }
    }

    #[test]
    fn entries_to_json_formats_addresses() {
        let entries = vec![
            (key_for("10.0.0.7".parse().unwrap()), FlowRecord { count: 3 }),
            (key_for("192.0.2.17".parse().unwrap()), FlowRecord { count: 0 }),
        ];
        let value = entries_to_json(entries);
        let array = value.as_array().expect("array");
        assert_eq!(array.len(), 2);
        assert_eq!(array[0]["address"], "10.0.0.7");
        assert_eq!(array[0]["count"], 3);
        assert_eq!(array[1]["address"], "192.0.2.17");
        assert_eq!(array[1]["count"], 0);
    }
}
