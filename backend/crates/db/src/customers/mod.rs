pub mod models;
pub mod mssql_repository;
pub mod repositories;
