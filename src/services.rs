pub mod gtfs_archive;
pub mod reconciler;
pub mod stop_fetcher;
