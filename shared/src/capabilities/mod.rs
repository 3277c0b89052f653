mod http;
mod location;

#[cfg(feature = "native-http")]
mod native;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

pub use self::http::{
    execute_with_timeout, ApiClient, HttpError, HttpHeaders, HttpMethod, HttpRequest,
    HttpResponse, HttpResult, HttpTransport, ValidatedUrl,
};
pub use self::location::{LocationError, LocationProvider, NoLocation};

#[cfg(feature = "native-http")]
pub use self::native::ReqwestTransport;

/// Side-effecting services the host provides to the core.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpTransport>,
    pub location: Arc<dyn LocationProvider>,
}

impl Capabilities {
    pub fn new(http: Arc<dyn HttpTransport>, location: Arc<dyn LocationProvider>) -> Self {
        Self { http, location }
    }

    /// HTTP only; GPS requests report permission denied.
    pub fn without_location(http: Arc<dyn HttpTransport>) -> Self {
        Self {
            http,
            location: Arc::new(NoLocation),
        }
    }
}
