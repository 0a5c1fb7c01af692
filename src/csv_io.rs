use crate::models::{LedgerRow, WalletOutput};
use csv_async::AsyncReaderBuilder;
use futures::stream::Stream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::compat::TokioAsyncReadCompatExt;

/// Stream open/transfer rows from an async reader
pub fn stream_rows<R: AsyncRead + Unpin + Send + 'static>(
    reader: R,
) -> impl Stream<Item = Result<LedgerRow, csv_async::Error>> {
    let compat_reader = reader.compat();
    let csv_reader = AsyncReaderBuilder::new()
        .trim(csv_async::Trim::All)
        .flexible(true)
        .create_deserializer(compat_reader);

    csv_reader.into_deserialize::<LedgerRow>()
}

pub async fn write_wallets<W: AsyncWrite + Unpin>(
    mut writer: W,
    wallets: Vec<WalletOutput>,
) -> Result<(), anyhow::Error> {
    writer.write_all(b"user,currency,balance\n").await?;

    for wallet in wallets {
        let line = format!("{},{},{}\n", wallet.user, wallet.currency, wallet.balance);
        writer.write_all(line.as_bytes()).await?;
    }

    writer.flush().await?;
    Ok(())
}
