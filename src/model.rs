pub mod stop_model;
pub mod transloc_api_model;
