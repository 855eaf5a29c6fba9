#![no_main]

use libfuzzer_sys::fuzz_target;
use logo_wialon_gateway::AddressMap;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    if let Ok(map) = AddressMap::parse(&text) {
        assert_eq!(map.iter().count(), map.len());
        assert_eq!(map.addresses().len(), map.len());
    }
});
