//! Demo `Simulation` service: a single vessel flying straight up.

use krpc_core::codec::{ObjectRef, TypeDesc, Value};
use krpc_core::service::{CallContext, CallOutcome, ProcedureSignature, ServiceRegistry};
use std::sync::{Arc, Mutex, PoisonError};

pub const SERVICE_NAME: &str = "Simulation";
const VESSEL_CLASS: &str = "Simulation.Vessel";
const SITUATION_ENUM: &str = "Simulation.Situation";

const GRAVITY: f64 = 9.81;
/// Acceleration at full throttle, in m/s^2.
const MAX_THRUST_ACCELERATION: f64 = 30.0;

/// Flight situation, exposed as `Simulation.Situation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Situation {
    PreLaunch = 0,
    Flying = 1,
    Landed = 2,
}

#[derive(Debug, Clone)]
struct VesselState {
    throttle: f32,
    altitude: f64,
    vertical_speed: f64,
    fuel: f64,
    situation: Situation,
}

#[derive(Debug)]
pub struct Vessel {
    name: String,
    parts: Vec<String>,
    state: Mutex<VesselState>,
}

impl Vessel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parts: vec![
                "Command Pod".to_string(),
                "Fuel Tank".to_string(),
                "Liquid Engine".to_string(),
            ],
            state: Mutex::new(VesselState {
                throttle: 0.0,
                altitude: 0.0,
                vertical_speed: 0.0,
                fuel: 1000.0,
                situation: Situation::PreLaunch,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, VesselState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn throttle(&self) -> f32 {
        self.state().throttle
    }

    pub fn altitude(&self) -> f64 {
        self.state().altitude
    }

    pub fn situation(&self) -> Situation {
        self.state().situation
    }

    /// Integrate `dt` seconds of flight.
    pub fn advance(&self, dt: f64) {
        let mut state = self.state();
        let throttle = if state.fuel > 0.0 {
            f64::from(state.throttle)
        } else {
            0.0
        };
        state.fuel = (state.fuel - throttle * 10.0 * dt).max(0.0);
        let acceleration = throttle * MAX_THRUST_ACCELERATION - GRAVITY;
        state.vertical_speed += acceleration * dt;
        state.altitude += state.vertical_speed * dt;
        if state.altitude <= 0.0 {
            state.altitude = 0.0;
            state.vertical_speed = 0.0;
            if state.situation == Situation::Flying {
                state.situation = Situation::Landed;
            }
        } else {
            state.situation = Situation::Flying;
        }
    }
}

/// Host-side simulation state shared with the procedure handlers.
#[derive(Debug, Clone)]
pub struct Simulation {
    vessel: Arc<Vessel>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            vessel: Arc::new(Vessel::new("Kerbal X")),
        }
    }

    pub fn vessel(&self) -> &Arc<Vessel> {
        &self.vessel
    }

    pub fn advance(&self, dt: f64) {
        self.vessel.advance(dt);
    }
}

fn vessel_arg(args: &[Value]) -> Result<Arc<Vessel>, String> {
    match args.first().and_then(Value::as_object) {
        Some(object) => object
            .downcast::<Vessel>()
            .ok_or_else(|| "Object is not a vessel".to_string()),
        None => Err("Vessel instance is null".to_string()),
    }
}

/// Run `f` against the vessel argument, turning a bad handle into a fault.
fn with_vessel(args: &[Value], f: impl FnOnce(&Vessel) -> CallOutcome) -> CallOutcome {
    match vessel_arg(args) {
        Ok(vessel) => f(&vessel),
        Err(message) => CallOutcome::fault(message),
    }
}

fn this() -> (&'static str, TypeDesc) {
    ("this", TypeDesc::class(VESSEL_CLASS))
}

/// Register the `Simulation` service backed by `simulation`.
pub fn register(services: &mut ServiceRegistry, simulation: &Simulation) -> krpc_core::Result<()> {
    services.set_documentation(SERVICE_NAME, "A toy flight simulation.");
    services.add_class(SERVICE_NAME, "Vessel", "A vessel in flight.");
    services.add_enumeration(
        SERVICE_NAME,
        "Situation",
        &[("PreLaunch", 0), ("Flying", 1), ("Landed", 2)],
    );

    let vessel = ObjectRef::from_arc(simulation.vessel.clone());
    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "get_ActiveVessel")
            .returns(TypeDesc::class(VESSEL_CLASS))
            .doc("The currently active vessel."),
        move |_, _| CallOutcome::value(Value::object(vessel.clone())),
    )?;

    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "get_UT")
            .returns(TypeDesc::Double)
            .doc("The current universal time in seconds."),
        |ctx, _| CallOutcome::value(ctx.universal_time()),
    )?;

    let (name, ty) = this();
    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "Vessel_get_Name")
            .param(name, ty)
            .returns(TypeDesc::String),
        |_, args| with_vessel(&args, |v| CallOutcome::value(v.name.as_str())),
    )?;

    let (name, ty) = this();
    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "Vessel_get_Throttle")
            .param(name, ty)
            .returns(TypeDesc::Float),
        |_, args| with_vessel(&args, |v| CallOutcome::value(v.throttle())),
    )?;

    let (name, ty) = this();
    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "Vessel_set_Throttle")
            .param(name, ty)
            .param("value", TypeDesc::Float),
        |_, args| {
            with_vessel(&args, |v| match args.get(1) {
                Some(Value::Float(value)) if (0.0..=1.0).contains(value) => {
                    v.state().throttle = *value;
                    CallOutcome::void()
                }
                Some(Value::Float(value)) => {
                    CallOutcome::fault(format!("Throttle {} is outside 0..1", value))
                }
                _ => CallOutcome::fault("Throttle must be a float"),
            })
        },
    )?;

    let (name, ty) = this();
    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "Vessel_get_Altitude")
            .param(name, ty)
            .returns(TypeDesc::Double),
        |_, args| with_vessel(&args, |v| CallOutcome::value(v.altitude())),
    )?;

    let (name, ty) = this();
    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "Vessel_get_Situation")
            .param(name, ty)
            .returns(TypeDesc::enumeration(SITUATION_ENUM)),
        |_, args| with_vessel(&args, |v| CallOutcome::value(Value::Enum(v.situation() as i32))),
    )?;

    let (name, ty) = this();
    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "Vessel_get_PartNames")
            .param(name, ty)
            .returns(TypeDesc::list(TypeDesc::String)),
        |_, args| {
            with_vessel(&args, |v| {
                let parts = v.parts.iter().map(|p| Value::from(p.as_str())).collect();
                CallOutcome::value(Value::List(parts))
            })
        },
    )?;

    let (name, ty) = this();
    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "Vessel_get_Resources")
            .param(name, ty)
            .returns(TypeDesc::dictionary(TypeDesc::String, TypeDesc::Double)),
        |_, args| {
            with_vessel(&args, |v| {
                let fuel = v.state().fuel;
                CallOutcome::value(Value::Dictionary(vec![(
                    Value::from("LiquidFuel"),
                    Value::Double(fuel),
                )]))
            })
        },
    )?;

    let (name, ty) = this();
    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "Vessel_Position")
            .param(name, ty)
            .returns(TypeDesc::Tuple(vec![
                TypeDesc::Double,
                TypeDesc::Double,
                TypeDesc::Double,
            ]))
            .doc("Position relative to the launch site, in metres."),
        |_, args| {
            with_vessel(&args, |v| {
                CallOutcome::value(Value::Tuple(vec![
                    Value::Double(0.0),
                    Value::Double(v.altitude()),
                    Value::Double(0.0),
                ]))
            })
        },
    )?;

    services.register_fn(
        ProcedureSignature::new(SERVICE_NAME, "WaitForTicks")
            .param_with_default("ticks", TypeDesc::UInt32, 1u32)
            .returns(TypeDesc::UInt64)
            .doc("Return after the given number of server ticks, with the tick number reached."),
        |ctx, args| {
            let ticks = args.first().and_then(Value::as_u32).unwrap_or(1);
            let target = ctx.tick() + u64::from(ticks);
            CallOutcome::suspend(move |ctx: &mut CallContext<'_>| {
                if ctx.tick() >= target {
                    CallOutcome::value(ctx.tick())
                } else {
                    CallOutcome::Pending
                }
            })
        },
    )?;

    Ok(())
}
