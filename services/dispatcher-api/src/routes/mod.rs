pub mod requested_tasks;
pub mod tasks;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    requested_tasks::configure(cfg);
    tasks::configure(cfg);
}
