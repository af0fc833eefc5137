use crate::{adapter::QueryAdapter, templating::TemplateSrv};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub api_key: Option<Arc<str>>,
    pub adapter: QueryAdapter,
    pub templates: Arc<TemplateSrv>,
}

impl AppState {
    pub fn new(api_key: Option<String>, adapter: QueryAdapter, templates: Arc<TemplateSrv>) -> Self {
        Self {
            api_key: api_key.map(Arc::from),
            adapter,
            templates,
        }
    }
}
