mod handlers;
mod hooks;
