mod proxy;

pub use proxy::{ProxyState, RequestTraceId, proxy_router};
