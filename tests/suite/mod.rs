mod integrity;
mod locks;
mod pipeline;
mod worker;
