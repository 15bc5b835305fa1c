// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::sink::EtrSink;
use crate::Error;
use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Sinks by device name
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Mutex<BTreeMap<String, Arc<EtrSink>>>,
}

impl SinkRegistry {
    pub fn new() -> SinkRegistry {
        SinkRegistry::default()
    }

    pub fn register(&self, sink: EtrSink) -> Result<Arc<EtrSink>, Error> {
        let mut sinks = self.sinks.lock();
        let name = sink.name().to_string();
        if sinks.contains_key(&name) {
            return Err(Error::AlreadyRegistered(name));
        }
        let sink = Arc::new(sink);
        sinks.insert(name.clone(), sink.clone());
        debug!("registered trace sink {name}");
        Ok(sink)
    }

    pub fn get(&self, name: &str) -> Option<Arc<EtrSink>> {
        self.sinks.lock().get(name).cloned()
    }

    /// Forget a sink. It is torn down once the last handle to it goes away.
    pub fn remove(&self, name: &str) -> Option<Arc<EtrSink>> {
        self.sinks.lock().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.sinks.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::sim::{HostDma, SimulatedTmc};
    use etr_regs::MemWidth;

    fn sink(dma: &Arc<HostDma>, name: &str) -> EtrSink {
        EtrSink::new(
            SinkConfig::new(name, 4096, MemWidth::Bits64),
            Box::new(SimulatedTmc::new(dma.clone())),
            dma.clone(),
        )
        .unwrap()
    }

    #[test]
    fn register_lookup_remove() {
        let dma = Arc::new(HostDma::new());
        let registry = SinkRegistry::new();
        registry.register(sink(&dma, "etr1")).unwrap();
        registry.register(sink(&dma, "etr0")).unwrap();

        assert!(matches!(
            registry.register(sink(&dma, "etr0")),
            Err(Error::AlreadyRegistered(name)) if name == "etr0"
        ));
        assert_eq!(registry.names(), vec!["etr0", "etr1"]);
        assert_eq!(registry.get("etr1").unwrap().name(), "etr1");

        assert!(registry.remove("etr1").is_some());
        assert!(registry.get("etr1").is_none());
        assert!(registry.remove("etr1").is_none());
    }
}
