//! Wires a [`ServiceConf`] into a live service.
//!
//! Function numbers are assigned here: `FetchFuncList` keeps its reserved
//! number 1, everything else gets sequential numbers over the name-sorted
//! function list, so numbering is stable across runs. Prototypes are bound
//! under full function names; handlers are looked up by the name the
//! config carries.

use std::collections::HashMap;

use crate::config::ServiceConf;
use crate::proto::ProtoBinder;
use crate::protocol::{FUNC_NAME_FUNC_LIST, FUNC_NO_FUNC_LIST};
use crate::service::{RpcHandler, Service};
use crate::util::full_func_name;

/// Applies declarative service configuration.
pub struct Builder;

impl Builder {
    /// Name the service, bind its prototypes, and install its handlers.
    ///
    /// Functions whose prototypes cannot be bound or whose handler name is
    /// unknown are reported and skipped; the rest of the config still
    /// applies.
    pub fn build_service(
        service: &dyn Service,
        binder: &ProtoBinder,
        conf: &ServiceConf,
        handlers: &HashMap<String, RpcHandler>,
    ) {
        service.set_name(&conf.name);

        let mut func_names: Vec<&String> = conf.func.keys().collect();
        func_names.sort();

        let mut next_func_no = FUNC_NO_FUNC_LIST;
        for func_name in func_names {
            if func_name == FUNC_NAME_FUNC_LIST {
                // Answered by the built-in responder.
                continue;
            }

            let func_conf = &conf.func[func_name];
            next_func_no += 1;

            let full = full_func_name(&conf.name, func_name);
            if let Err(e) = binder.bind_proto(&full, &func_conf.req, &func_conf.resp) {
                tracing::warn!(func = %full, error = %e, "not support func");
                continue;
            }

            match handlers.get(&func_conf.handler) {
                Some(handler) => service.add_processor(handler.clone(), next_func_no, func_name),
                None => {
                    tracing::warn!(func = %full, handler = %func_conf.handler, "handler not found");
                }
            }
        }
    }
}
