use platter::cli::Error;


#[tokio::main]
async fn main() -> Result<(), Error> {
    platter::cli::run().await
}
