pub mod domain;
pub mod ports;

pub use domain::{
    CandidateMessage, Interview, InterviewId, InterviewerMessage, Review, ReviewJob, Role,
    Session, Transcript, UserId,
};
pub use ports::{
    Acknowledger, AudioStorage, AuthSessionValidator, ChatMessage, Delivery, DeliveryStream,
    InterviewRepository, JobQueue, LanguageModel, PortError, PortResult, TextToSpeechService,
};
