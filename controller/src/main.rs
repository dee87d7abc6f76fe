mod actuator;
mod evaluator;
mod host;
mod store;
mod sync;
#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
