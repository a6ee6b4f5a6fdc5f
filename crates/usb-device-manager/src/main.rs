#[tokio::main]
async fn main() -> anyhow::Result<()> {
  k8s_usb_device_manager::app::run().await
}
