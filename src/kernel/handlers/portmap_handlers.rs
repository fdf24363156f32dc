use num_derive::{FromPrimitive, ToPrimitive};
use tracing::{debug, trace};

use crate::kernel::api::portmap::mapping;
use crate::settings::PortmapSettings;

/*
From RFC 1833
program PMAP_PROG {
   version PMAP_VERS {
      void         PMAPPROC_NULL(void)         = 0;
      bool         PMAPPROC_SET(mapping)       = 1;
      bool         PMAPPROC_UNSET(mapping)     = 2;
      unsigned int PMAPPROC_GETPORT(mapping)   = 3;
      pmaplist     PMAPPROC_DUMP(void)         = 4;
      call_result  PMAPPROC_CALLIT(call_args)  = 5;
   } = 2;
} = 100000;
*/

#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum PortmapProgram {
    PMAPPROC_NULL = 0,
    PMAPPROC_SET = 1,
    PMAPPROC_UNSET = 2,
    PMAPPROC_GETPORT = 3,
    PMAPPROC_DUMP = 4,
    PMAPPROC_CALLIT = 5,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortmapRequest {
    Null,
    Getport(mapping),
    Dump,
}

impl PortmapRequest {
    pub fn procedure(&self) -> PortmapProgram {
        match self {
            PortmapRequest::Null => PortmapProgram::PMAPPROC_NULL,
            PortmapRequest::Getport(_) => PortmapProgram::PMAPPROC_GETPORT,
            PortmapRequest::Dump => PortmapProgram::PMAPPROC_DUMP,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortmapResponse {
    Null,
    /// Zero when nothing is registered.
    Getport(u32),
    Dump(Vec<mapping>),
}

/// Named, static program registrations. SET and UNSET are not offered.
#[derive(Clone, Debug, Default)]
pub struct PortmapService {
    table: Vec<(String, mapping)>,
}

impl PortmapService {
    pub fn new(table: impl IntoIterator<Item = (String, mapping)>) -> PortmapService {
        PortmapService {
            table: table.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &PortmapSettings) -> PortmapService {
        PortmapService::new(settings.mappings.iter().map(|m| {
            (
                m.name.clone(),
                mapping {
                    prog: m.prog,
                    vers: m.vers,
                    prot: m.prot,
                    port: m.port,
                },
            )
        }))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &mapping)> {
        self.table.iter().map(|(name, m)| (name.as_str(), m))
    }

    pub fn getport(&self, query: &mapping) -> u32 {
        self.table
            .iter()
            .find(|(_, m)| m.prog == query.prog && m.vers == query.vers && m.prot == query.prot)
            .map(|(_, m)| m.port)
            .unwrap_or(0)
    }

    pub fn dump(&self) -> Vec<mapping> {
        self.table.iter().map(|(_, m)| *m).collect()
    }
}

pub fn handle_portmap(request: PortmapRequest, service: &PortmapService) -> PortmapResponse {
    trace!("portmap {:?}", request.procedure());
    match request {
        PortmapRequest::Null => PortmapResponse::Null,
        PortmapRequest::Getport(query) => {
            let port = service.getport(&query);
            debug!("portmap getport({:?}) -> {}", query, port);
            PortmapResponse::Getport(port)
        }
        PortmapRequest::Dump => PortmapResponse::Dump(service.dump()),
    }
}
