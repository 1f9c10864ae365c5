mod handlers;
mod routes;

pub use handlers::{
    ApiError, AppState, NamespaceQuery, ProviderInfo, VersionInfo, get_function, get_info,
    healthz, list_functions, scale_function,
};
pub use routes::{ApiDoc, create_router};
