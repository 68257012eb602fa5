//! `crypto.createHmac` — adapted from the teacher's native `crypto` module,
//! installed directly as a global rather than through an ES module loader
//! (this runtime has no multi-file module graph to resolve).

use std::cell::RefCell;
use std::rc::Rc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::digest::{FixedOutputReset, KeyInit};
use hmac::Mac;
use rquickjs::class::Trace;
use rquickjs::object::Property;
use rquickjs::{Class, Ctx, Exception, Function, JsLifetime, Object, Result, Value};
use sha2::{Sha256, Sha384, Sha512};

fn as_bytes(value: Value<'_>) -> Result<Vec<u8>> {
    if let Some(txt) = value.as_string() {
        return Ok(txt.to_string()?.into_bytes());
    }
    if let Some(obj) = value.as_object() {
        if let Some(array) = obj.as_typed_array::<u8>() {
            return Ok(array.as_bytes().unwrap_or_default().to_vec());
        }
    }
    Err(Exception::throw_type(value.ctx(), "Expected a String or Uint8Array"))
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct Hmac {
    #[qjs(skip_trace)]
    inner: Rc<RefCell<HmacInner>>,
}

#[rquickjs::methods]
impl Hmac {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>, algorithm: String, key: Value<'_>) -> Result<Self> {
        let key = as_bytes(key)?;
        let inner = match algorithm.to_lowercase().as_str() {
            "sha256" => HmacInner::with_key::<hmac::Hmac<Sha256>>(&ctx, key),
            "sha384" => HmacInner::with_key::<hmac::Hmac<Sha384>>(&ctx, key),
            "sha512" => HmacInner::with_key::<hmac::Hmac<Sha512>>(&ctx, key),
            _ => Err(Exception::throw_type(&ctx, &format!("Invalid algorithm: {algorithm:?}"))),
        }?;
        Ok(Self { inner })
    }

    pub fn update(&mut self, data: Value<'_>) -> Result<Self> {
        self.inner.borrow_mut().update(data)?;
        Ok(self.clone())
    }

    pub fn finalize(&mut self) -> Self {
        self.inner.borrow_mut().finalize();
        self.clone()
    }

    pub fn digest(&mut self, ctx: Ctx<'_>, format: String) -> Result<String> {
        self.inner.borrow_mut().digest(ctx, format)
    }
}

trait DynHmac {
    fn update(&mut self, data: &[u8]);
    fn finalize(&mut self) -> Vec<u8>;
}

impl<T: Mac + FixedOutputReset> DynHmac for T {
    fn update(&mut self, data: &[u8]) {
        Mac::update(self, data)
    }

    fn finalize(&mut self) -> Vec<u8> {
        Mac::finalize_reset(self).into_bytes().to_vec()
    }
}

struct HmacInner_<T: DynHmac + ?Sized> {
    result: Vec<u8>,
    hmac: T,
}

type HmacInner = HmacInner_<dyn DynHmac>;

impl HmacInner {
    fn with_key<T: DynHmac + KeyInit + 'static>(ctx: &Ctx<'_>, key: impl AsRef<[u8]>) -> Result<Rc<RefCell<Self>>> {
        let hmac = T::new_from_slice(key.as_ref())
            .map_err(|e| Exception::throw_type(ctx, &format!("Invalid hmac key: {e:#?}")))?;
        Ok(Rc::new(RefCell::new(HmacInner_ { result: Vec::new(), hmac })))
    }

    fn update(&mut self, data: Value<'_>) -> Result<&mut Self> {
        let data = as_bytes(data)?;
        if !self.result.is_empty() {
            self.result.clear();
        }
        self.hmac.update(&data);
        Ok(self)
    }

    fn finalize(&mut self) -> &mut Self {
        self.result = self.hmac.finalize();
        self
    }

    fn digest(&mut self, ctx: Ctx<'_>, format: String) -> Result<String> {
        if self.result.is_empty() {
            self.finalize();
        }
        match format.to_lowercase().as_str() {
            "base64" => Ok(STANDARD.encode(&self.result)),
            "base64url" => Ok(URL_SAFE_NO_PAD.encode(&self.result)),
            "hex" => Ok(hex::encode(&self.result)),
            _ => Err(Exception::throw_type(&ctx, &format!("Unsupported format: {format:?}"))),
        }
    }
}

fn create_hmac<'js>(ctx: Ctx<'js>, algo: String, key: Value<'js>) -> Result<Hmac> {
    Hmac::new(ctx, algo, key)
}

pub fn install(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    let crypto = Object::new(ctx.clone())?;
    crypto.set("createHmac", Function::new(ctx.clone(), create_hmac))?;
    crypto.set("Hmac", Class::<Hmac>::create_constructor(ctx)?)?;
    globals.prop("crypto", Property::from(crypto))?;
    Ok(())
}
