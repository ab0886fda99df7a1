use crate::error::RpcError;
use crate::RedisPool;
use r2d2::Pool;
use redis::Client;

/// Creates a [`RedisPool`](crate::RedisPool) for the given url.
///
/// # Errors
///
/// Returns [`RpcError`](RpcError) when the client cannot be opened or the
/// pool cannot be built.
///
/// # Examples
/// ```no_run
/// # use redis_rpc::helpers::connect;
/// let pool = connect("redis://127.0.0.1:6379/0").expect("Redis pool cannot be built.");
/// let connection = pool.get().expect("Cannot extract connection!");
/// // Connection is ready to use!
/// ```
pub fn connect(redis_url: &str) -> Result<RedisPool, RpcError> {
    let client = Client::open(redis_url)?;
    let pool = Pool::builder().build(client)?;
    Ok(pool)
}
