use roost::command::Error;


#[tokio::main]
async fn main() -> Result<(), Error> {
    roost::command::run().await
}
